use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::directive::{InputDirective, OutputDirective};
use crate::fs::join_path;
use crate::state::TaskState;

pub type TaskId = Uuid;

/// Callback de cambio de estado: (tarea, estado anterior, estado nuevo).
pub type TaskCallback = Arc<dyn Fn(&Task, TaskState, TaskState) + Send + Sync>;

/// Referencia liviana a una tarea, usada por las directivas `Task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    pub name: String,
    pub dir_name: String,
}

/// Una unidad de trabajo remota más sus directivas de movimiento de datos.
///
/// `Task` no es `Clone`: pasa de una etapa a otra por valor, así que en cada
/// momento hay un único dueño que puede mutarla. Los callbacks viajan con ella.
pub struct Task {
    id: TaskId,
    name: String,
    dir_name: String,
    executable: String,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    cores: u32,
    input: Vec<InputDirective>,
    output: Vec<OutputDirective>,

    state: TaskState,
    log: Vec<String>,
    callbacks: Vec<TaskCallback>,
    remote_workdir_url: Option<Url>,
}

impl Task {
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let name = name.into();
        let dir_name = format!("{}__{}", name, id);
        Self {
            id,
            name,
            dir_name,
            executable: executable.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            cores: 1,
            input: Vec::new(),
            output: Vec::new(),
            state: TaskState::New,
            log: Vec::new(),
            callbacks: Vec::new(),
            remote_workdir_url: None,
        }
    }

    pub fn with_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.environment = env;
        self
    }

    /// 0 se trata como 1.
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores.max(1);
        self
    }

    pub fn with_input(mut self, input: Vec<InputDirective>) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Vec<OutputDirective>) -> Self {
        self.output = output;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn input(&self) -> &[InputDirective] {
        &self.input
    }

    pub fn output(&self) -> &[OutputDirective] {
        &self.output
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn reference(&self) -> TaskRef {
        TaskRef {
            id: self.id,
            name: self.name.clone(),
            dir_name: self.dir_name.clone(),
        }
    }

    /// URL del directorio base de la asignación (no el de la tarea).
    pub fn remote_workdir_url(&self) -> Option<&Url> {
        self.remote_workdir_url.as_ref()
    }

    /// Directorio de trabajo propio: `<base>/<name>__<id>/`.
    pub fn workdir_url(&self) -> Option<Url> {
        self.remote_workdir_url
            .as_ref()
            .map(|base| join_path(base, &format!("{}/", self.dir_name)))
    }

    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Task, TaskState, TaskState) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub fn register_callbacks<I>(&mut self, callbacks: I)
    where
        I: IntoIterator<Item = TaskCallback>,
    {
        self.callbacks.extend(callbacks);
    }

    pub(crate) fn append_log(&mut self, entry: impl Into<String>) {
        self.log.push(entry.into());
    }

    /// Se asigna una sola vez; reasignar con otra URL es un error.
    pub(crate) fn assign_remote_workdir(&mut self, url: Url) -> Result<()> {
        match &self.remote_workdir_url {
            Some(current) if *current != url => bail!(
                "la tarea '{}' ya tiene directorio remoto {} (no se puede cambiar a {})",
                self.name,
                current,
                url
            ),
            Some(_) => Ok(()),
            None => {
                self.remote_workdir_url = Some(url);
                Ok(())
            }
        }
    }

    /// Cambia el estado y avisa a los callbacks.
    /// Mismo estado: no hace nada. Transición inválida: se ignora y devuelve false.
    pub(crate) fn set_state(&mut self, new_state: TaskState) -> bool {
        if self.state == new_state {
            return false;
        }
        if !self.state.can_transition_to(new_state) {
            warn!(
                task = %self.id,
                "transición inválida {} -> {} ignorada para tarea {}",
                self.state, new_state, self.name
            );
            return false;
        }

        let old_state = self.state;
        self.state = new_state;
        debug!(task = %self.id, "tarea {}: {} -> {}", self.name, old_state, new_state);

        let this: &Task = self;
        for callback in &this.callbacks {
            callback(this, old_state, new_state);
        }
        true
    }

    /// Atajo para fallar: deja el motivo en el log y pasa a `Failed`.
    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.append_log(reason);
        self.set_state(TaskState::Failed);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("cores", &self.cores)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
