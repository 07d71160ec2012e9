use anyhow::{bail, Result};
use async_trait::async_trait;
use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::{watch, Semaphore},
    time::Instant,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{ComputeUnit, Pilot, PilotBackend, PilotDescription, PilotService, UnitDescription};

/// Backend que aloja los pilots en este proceso.
/// Cada unidad es un proceso hijo; los cores del pilot se reparten con un semáforo.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PilotBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self, broker: &Url) -> Result<Arc<dyn PilotService>> {
        // no hay coordinador externo; el broker se ignora
        debug!("backend local: ignorando broker {}", broker);
        Ok(Arc::new(LocalService))
    }
}

pub struct LocalService;

#[async_trait]
impl PilotService for LocalService {
    async fn create_pilot(&self, description: &PilotDescription) -> Result<Arc<dyn Pilot>> {
        Ok(Arc::new(LocalPilot::start(description.clone())?))
    }
}

pub struct LocalPilot {
    id: String,
    description: PilotDescription,
    started: Instant,
    slots: Arc<Semaphore>,
    cancel_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
}

impl LocalPilot {
    pub fn start(description: PilotDescription) -> Result<Self> {
        if description.cores == 0 {
            bail!("un pilot necesita al menos 1 core");
        }
        let (cancel_tx, _) = watch::channel(false);
        let id = format!("pilot-{}", Uuid::new_v4());
        info!(
            "pilot local {} iniciado (cores={}, walltime={}min, cola={})",
            id, description.cores, description.walltime_minutes, description.queue
        );
        Ok(Self {
            id,
            slots: Arc::new(Semaphore::new(description.cores as usize)),
            description,
            started: Instant::now(),
            cancel_tx,
            cancelled: AtomicBool::new(false),
        })
    }

    fn walltime(&self) -> Duration {
        Duration::from_secs(self.description.walltime_minutes.saturating_mul(60))
    }

    fn expired(&self) -> bool {
        self.started.elapsed() >= self.walltime()
    }
}

#[async_trait]
impl Pilot for LocalPilot {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok("Canceled".to_string());
        }
        if self.expired() {
            // se acabó el walltime: matamos lo que quede corriendo
            if !*self.cancel_tx.borrow() {
                info!("pilot {} agotó su walltime", self.id);
                self.cancel_tx.send_replace(true);
            }
            return Ok("Done".to_string());
        }
        Ok("Running".to_string())
    }

    async fn submit_unit(&self, description: &UnitDescription) -> Result<Arc<dyn ComputeUnit>> {
        if self.cancelled.load(Ordering::SeqCst) || self.expired() {
            bail!("el pilot {} ya no acepta unidades", self.id);
        }
        if description.cores > self.description.cores {
            bail!(
                "la unidad pide {} cores pero el pilot {} sólo tiene {}",
                description.cores,
                self.id,
                self.description.cores
            );
        }

        let unit = Arc::new(LocalUnit {
            id: format!("unit-{}", Uuid::new_v4()),
            state: Arc::new(Mutex::new("New".to_string())),
        });

        tokio::spawn(run_unit(
            unit.id.clone(),
            description.clone(),
            self.slots.clone(),
            self.cancel_tx.subscribe(),
            unit.state.clone(),
        ));

        Ok(unit)
    }

    async fn cancel(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_tx.send_replace(true);
        info!("pilot {} cancelado", self.id);
        Ok(())
    }
}

pub struct LocalUnit {
    id: String,
    state: Arc<Mutex<String>>,
}

#[async_trait]
impl ComputeUnit for LocalUnit {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

fn set_unit_state(state: &Mutex<String>, value: &str) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value.to_string();
}

// Termina cuando el pilot se cancela (o cuando el pilot ya no existe)
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn spawn_child(desc: &UnitDescription) -> Result<Child> {
    let wd = PathBuf::from(&desc.working_directory);
    let stdout = tokio::fs::File::create(wd.join(&desc.output))
        .await?
        .into_std()
        .await;
    let stderr = tokio::fs::File::create(wd.join(&desc.error))
        .await?
        .into_std()
        .await;

    let child = Command::new(&desc.executable)
        .args(&desc.arguments)
        .envs(&desc.environment)
        .current_dir(&wd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Ciclo de vida de una unidad: esperar cores -> correr -> Done/Failed.
async fn run_unit(
    unit_id: String,
    desc: UnitDescription,
    slots: Arc<Semaphore>,
    mut cancel_rx: watch::Receiver<bool>,
    state: Arc<Mutex<String>>,
) {
    let permit = tokio::select! {
        p = slots.acquire_many_owned(desc.cores) => match p {
            Ok(p) => p,
            Err(_) => {
                set_unit_state(&state, "Failed");
                return;
            }
        },
        _ = cancelled(&mut cancel_rx) => {
            set_unit_state(&state, "Canceled");
            return;
        }
    };

    let mut child = match spawn_child(&desc).await {
        Ok(c) => c,
        Err(e) => {
            warn!("no se pudo lanzar la unidad {} ({}): {:#}", unit_id, desc.executable, e);
            set_unit_state(&state, "Failed");
            return;
        }
    };
    set_unit_state(&state, "Running");
    debug!("unidad {} corriendo: {} {:?}", unit_id, desc.executable, desc.arguments);

    let finished = tokio::select! {
        s = child.wait() => Some(s),
        _ = cancelled(&mut cancel_rx) => None,
    };
    let Some(status) = finished else {
        let _ = child.kill().await;
        set_unit_state(&state, "Canceled");
        return;
    };

    match status {
        Ok(s) if s.success() => {
            debug!("unidad {} terminó bien", unit_id);
            set_unit_state(&state, "Done");
        }
        Ok(s) => {
            warn!("unidad {} terminó con {}", unit_id, s);
            set_unit_state(&state, "Failed");
        }
        Err(e) => {
            warn!("error esperando la unidad {}: {:?}", unit_id, e);
            set_unit_state(&state, "Failed");
        }
    }

    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("bjasync_local_pilot_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn pilot_desc(cores: u32, walltime_minutes: u64) -> PilotDescription {
        PilotDescription {
            service_url: "fork://localhost".to_string(),
            cores,
            walltime_minutes,
            queue: "default".to_string(),
            project: None,
            working_directory: "/tmp".to_string(),
            scheduler_variant: None,
        }
    }

    fn unit_desc(wd: &PathBuf, exe: &str, args: &[&str]) -> UnitDescription {
        UnitDescription {
            executable: exe.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            environment: Default::default(),
            working_directory: wd.to_string_lossy().to_string(),
            cores: 1,
            output: "STDOUT".to_string(),
            error: "STDERR".to_string(),
        }
    }

    async fn wait_for(unit: &Arc<dyn ComputeUnit>, wanted: &str) -> String {
        let mut last = String::new();
        for _ in 0..400 {
            last = unit.state().await.unwrap();
            if last == wanted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        last
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unidad_escribe_stdout_y_termina_en_done() {
        let wd = temp_dir("ok");
        let pilot = LocalPilot::start(pilot_desc(2, 10)).unwrap();
        assert_eq!(pilot.state().await.unwrap(), "Running");

        let unit = pilot
            .submit_unit(&unit_desc(&wd, "/bin/sh", &["-c", "echo hola"]))
            .await
            .unwrap();

        assert_eq!(wait_for(&unit, "Done").await, "Done");
        assert_eq!(fs::read_to_string(wd.join("STDOUT")).unwrap().trim(), "hola");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn salida_distinta_de_cero_es_failed() {
        let wd = temp_dir("fail");
        let pilot = LocalPilot::start(pilot_desc(1, 10)).unwrap();
        let unit = pilot
            .submit_unit(&unit_desc(&wd, "/bin/sh", &["-c", "exit 3"]))
            .await
            .unwrap();

        assert_eq!(wait_for(&unit, "Failed").await, "Failed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelar_el_pilot_mata_las_unidades() {
        let wd = temp_dir("cancel");
        let pilot = LocalPilot::start(pilot_desc(1, 10)).unwrap();
        let unit = pilot
            .submit_unit(&unit_desc(&wd, "/bin/sleep", &["30"]))
            .await
            .unwrap();
        assert_eq!(wait_for(&unit, "Running").await, "Running");

        pilot.cancel().await.unwrap();

        assert_eq!(wait_for(&unit, "Canceled").await, "Canceled");
        assert_eq!(pilot.state().await.unwrap(), "Canceled");
        assert!(pilot
            .submit_unit(&unit_desc(&wd, "/bin/true", &[]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unidad_con_mas_cores_que_el_pilot_se_rechaza() {
        let wd = temp_dir("cores");
        let pilot = LocalPilot::start(pilot_desc(2, 10)).unwrap();
        let mut desc = unit_desc(&wd, "/bin/true", &[]);
        desc.cores = 4;

        let err = pilot.submit_unit(&desc).await.err().unwrap();
        assert!(err.to_string().contains("4 cores"));
    }

    #[tokio::test]
    async fn walltime_agotado_reporta_done() {
        let pilot = LocalPilot::start(pilot_desc(1, 0)).unwrap();
        assert_eq!(pilot.state().await.unwrap(), "Done");
    }

    #[tokio::test]
    async fn walltime_enorme_no_desborda() {
        let pilot = LocalPilot::start(pilot_desc(1, u64::MAX)).unwrap();
        assert_eq!(pilot.state().await.unwrap(), "Running");
    }

    #[test]
    fn pilot_sin_cores_es_error() {
        assert!(LocalPilot::start(pilot_desc(0, 10)).is_err());
    }
}
