use anyhow::{anyhow, bail, Context, Result};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};
use url::Url;

use crate::fs::join_path;
use crate::pilot::{BackendKind, PilotDescription};
use crate::resource::ResourceDescriptor;
use crate::state::AllocationState;

/// Callback de cambio de estado de la asignación.
pub type AllocationCallback =
    Arc<dyn Fn(&Allocation, AllocationState, AllocationState) + Send + Sync>;

/// Lo que pide el que llama: un pilot sobre un recurso.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub name: String,
    pub resource: ResourceDescriptor,
    pub runtime_minutes: u64,
    pub cores: u32,
    /// Directorio base en el filesystem compartido del recurso.
    pub workdir: String,
    pub username: Option<String>,
    pub project_id: Option<String>,
    /// Si está, pisa la cola del descriptor.
    pub queue: Option<String>,
    pub backend: BackendKind,
}

impl AllocationRequest {
    pub fn new(name: impl Into<String>, resource: ResourceDescriptor, workdir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource,
            runtime_minutes: 10,
            cores: 1,
            workdir: workdir.into(),
            username: None,
            project_id: None,
            queue: None,
            backend: BackendKind::default(),
        }
    }
}

/// Tope de runtime que acepta una asignación (un año).
pub const MAX_RUNTIME_MINUTES: u64 = 60 * 24 * 365;

/// Redondea hacia arriba al múltiplo de `increment` (si hay incremento).
/// `None` si el resultado no entra en un `u32`.
pub fn round_up_cores(cores: u32, increment: Option<u32>) -> Option<u32> {
    let cores = cores.max(1);
    match increment {
        Some(inc) if inc > 1 => cores.div_ceil(inc).checked_mul(inc),
        _ => Some(cores),
    }
}

/// Una reserva de pilot y su ciclo de vida.
pub struct Allocation {
    name: String,
    resource: ResourceDescriptor,
    runtime_minutes: u64,
    cores: u32,
    workdir: String,
    username: Option<String>,
    project_id: Option<String>,
    queue: Option<String>,
    backend: BackendKind,

    state: AllocationState,
    log: Vec<String>,
    callbacks: Vec<AllocationCallback>,
    remote_workdir_url: Url,
}

impl Allocation {
    /// Valida el pedido, redondea los cores y arma la URL del directorio base.
    pub fn new(request: AllocationRequest) -> Result<Self> {
        if request.runtime_minutes == 0 {
            bail!("la asignación '{}' pide 0 minutos de runtime", request.name);
        }
        if request.runtime_minutes > MAX_RUNTIME_MINUTES {
            bail!(
                "la asignación '{}' pide {} minutos de runtime (máximo {})",
                request.name,
                request.runtime_minutes,
                MAX_RUNTIME_MINUTES
            );
        }

        let cores = round_up_cores(request.cores, request.resource.core_increment)
            .ok_or_else(|| {
                anyhow!(
                    "la asignación '{}': {} cores no se pueden redondear al incremento {:?}",
                    request.name,
                    request.cores,
                    request.resource.core_increment
                )
            })?;
        if cores != request.cores {
            info!(
                "asignación {}: {} cores redondeados a {} (incremento {:?})",
                request.name, request.cores, cores, request.resource.core_increment
            );
        }

        let shared = Url::parse(&request.resource.shared_fs_url).with_context(|| {
            format!("shared_fs_url inválida: {}", request.resource.shared_fs_url)
        })?;
        let mut workdir = request.workdir.clone();
        if !workdir.ends_with('/') {
            workdir.push('/');
        }
        let mut remote_workdir_url = join_path(&shared, &workdir);
        if let Some(user) = &request.username {
            embed_username(&mut remote_workdir_url, user);
        }

        Ok(Self {
            name: request.name,
            resource: request.resource,
            runtime_minutes: request.runtime_minutes,
            cores,
            workdir: request.workdir,
            username: request.username,
            project_id: request.project_id,
            queue: request.queue,
            backend: request.backend,
            state: AllocationState::New,
            log: Vec::new(),
            callbacks: Vec::new(),
            remote_workdir_url,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    pub fn runtime_minutes(&self) -> u64 {
        self.runtime_minutes
    }

    /// Cores ya redondeados.
    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// La cola explícita gana sobre la del descriptor.
    pub fn effective_queue(&self) -> &str {
        self.queue
            .as_deref()
            .unwrap_or(&self.resource.job_manager_queue)
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn remote_workdir_url(&self) -> &Url {
        &self.remote_workdir_url
    }

    pub fn broker_url(&self) -> Result<Url> {
        self.resource.broker_url()
    }

    /// URL del job manager con el usuario embebido (si hay).
    pub fn service_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.resource.job_manager_url).with_context(|| {
            format!("job_manager_url inválida: {}", self.resource.job_manager_url)
        })?;
        if let Some(user) = &self.username {
            embed_username(&mut url, user);
        }
        Ok(url)
    }

    pub fn pilot_description(&self) -> Result<PilotDescription> {
        Ok(PilotDescription {
            service_url: self.service_url()?.to_string(),
            cores: self.cores,
            walltime_minutes: self.runtime_minutes,
            queue: self.effective_queue().to_string(),
            project: self.project_id.clone(),
            working_directory: self.remote_workdir_url.path().to_string(),
            scheduler_variant: self.resource.scheduler_variant.clone(),
        })
    }

    /// Los callbacks corren con la asignación bloqueada por el supervisor:
    /// no deben volver a llamar al supervisor.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Allocation, AllocationState, AllocationState) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub fn register_callbacks<I>(&mut self, callbacks: I)
    where
        I: IntoIterator<Item = AllocationCallback>,
    {
        self.callbacks.extend(callbacks);
    }

    pub(crate) fn append_log(&mut self, entry: impl Into<String>) {
        self.log.push(entry.into());
    }

    pub(crate) fn set_state(&mut self, new_state: AllocationState) -> bool {
        if self.state == new_state {
            return false;
        }
        if !self.state.can_transition_to(new_state) {
            warn!(
                allocation = %self.name,
                "transición inválida {} -> {} ignorada",
                self.state, new_state
            );
            return false;
        }

        let old_state = self.state;
        self.state = new_state;
        debug!(allocation = %self.name, "asignación: {} -> {}", old_state, new_state);

        let this: &Allocation = self;
        for callback in &this.callbacks {
            callback(this, old_state, new_state);
        }
        true
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.append_log(reason);
        self.set_state(AllocationState::Failed);
    }
}

// file:// no admite usuario; en ese caso se omite
fn embed_username(url: &mut Url, user: &str) {
    if url.set_username(user).is_err() {
        debug!("la URL {} no admite usuario, se omite '{}'", url, user);
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("cores", &self.cores)
            .field("runtime_minutes", &self.runtime_minutes)
            .field("remote_workdir_url", &self.remote_workdir_url.as_str())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
