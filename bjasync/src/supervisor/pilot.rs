use anyhow::{anyhow, Context, Result};
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::STRANDED;
use crate::allocation::Allocation;
use crate::fs::RemoteFs;
use crate::pilot::{ComputeUnit, Pilot, PilotBackend, UnitDescription};
use crate::queue::Pipeline;
use crate::state::{translate_remote, AllocationState, RemoteStatus, TaskState};
use crate::task::Task;

/// Una tarea metida en el pilot (o a punto de serlo).
struct InFlight {
    task: Task,
    unit: Option<Arc<dyn ComputeUnit>>,
}

/// Dueño del pilot de una asignación y de las tareas que corren en él.
pub(crate) struct PilotSupervisor {
    allocation: Arc<Mutex<Allocation>>,
    fs: Arc<dyn RemoteFs>,
    backend: Arc<dyn PilotBackend>,
    pipeline: Arc<Pipeline>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    watchdog_grace: Duration,
    in_flight: Vec<InFlight>,
}

impl PilotSupervisor {
    pub fn new(
        allocation: Arc<Mutex<Allocation>>,
        fs: Arc<dyn RemoteFs>,
        backend: Arc<dyn PilotBackend>,
        pipeline: Arc<Pipeline>,
        stop: Arc<AtomicBool>,
        poll_interval: Duration,
        watchdog_grace: Duration,
    ) -> Self {
        Self {
            allocation,
            fs,
            backend,
            pipeline,
            stop,
            poll_interval,
            watchdog_grace,
            in_flight: Vec::new(),
        }
    }

    fn with_allocation<R>(&self, f: impl FnOnce(&mut Allocation) -> R) -> R {
        let mut alloc = self.allocation.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut alloc)
    }

    fn breadcrumb(&self, entry: String) {
        self.with_allocation(|a| a.append_log(entry));
    }

    pub async fn run(mut self) {
        let started = Instant::now();
        let (name, runtime_minutes) =
            self.with_allocation(|a| (a.name().to_string(), a.runtime_minutes()));

        let pilot = match self.launch().await {
            Ok(p) => p,
            Err(e) => {
                warn!(allocation = %name, "no se pudo lanzar el pilot: {:#}", e);
                self.with_allocation(|a| a.fail(format!("{:#}", e)));
                self.strand();
                return;
            }
        };
        self.with_allocation(|a| a.set_state(AllocationState::Pending));
        info!(allocation = %name, pilot = %pilot.id(), "pilot lanzado");

        let deadline = Duration::from_secs(runtime_minutes.saturating_mul(60))
            .saturating_add(self.watchdog_grace);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(allocation = %name, "stop pedido, apagando el pilot");
                break;
            }
            if started.elapsed() >= deadline {
                warn!(
                    allocation = %name,
                    "watchdog: pasaron {:?} (runtime {} min), apagando el pilot",
                    started.elapsed(),
                    runtime_minutes
                );
                self.breadcrumb(format!(
                    "Watchdog: se agotó el runtime de {} minutos, cancelando el pilot",
                    runtime_minutes
                ));
                break;
            }

            self.poll_pilot(pilot.as_ref()).await;
            self.take_ready();
            self.step_in_flight(pilot.as_ref()).await;

            sleep(self.poll_interval).await;
        }

        self.shutdown(pilot.as_ref()).await;
    }

    /// Directorio base, descripción, conexión y creación: un solo dominio de falla.
    async fn launch(&self) -> Result<Arc<dyn Pilot>> {
        let (base, broker, description) = self.with_allocation(|a| -> Result<_> {
            Ok((
                a.remote_workdir_url().clone(),
                a.broker_url()?,
                a.pilot_description()?,
            ))
        })?;

        self.breadcrumb(format!("Creando directorio de trabajo {}", base));
        self.fs
            .create_dir(&base, true)
            .await
            .with_context(|| format!("no se pudo crear el directorio base {}", base))?;

        let mut shown = broker.clone();
        let _ = shown.set_password(None);
        self.breadcrumb(format!(
            "Conectando al broker {} (backend {})",
            shown,
            self.backend.name()
        ));
        let service = self
            .backend
            .connect(&broker)
            .await
            .with_context(|| format!("no se pudo conectar al broker {}", shown))?;

        self.breadcrumb(format!(
            "Lanzando pilot en {} ({} cores, {} min, cola {})",
            description.service_url,
            description.cores,
            description.walltime_minutes,
            description.queue
        ));
        let pilot = service
            .create_pilot(&description)
            .await
            .context("no se pudo crear el pilot")?;
        Ok(pilot)
    }

    async fn poll_pilot(&self, pilot: &dyn Pilot) {
        if self.with_allocation(|a| a.state().is_terminal()) {
            return;
        }
        let result = pilot.state().await;
        self.with_allocation(|a| match result {
            Ok(raw) => match translate_remote(&raw) {
                RemoteStatus::Unrecognized(raw) => {
                    a.fail(format!("estado remoto desconocido para el pilot: '{}'", raw))
                }
                status => {
                    a.set_state(status.allocation_state());
                }
            },
            Err(e) => a.fail(format!("{:#}", e)),
        });
    }

    /// Pasa lo que hay ahora en la cola de ejecución al conjunto en vuelo.
    fn take_ready(&mut self) {
        for task in self.pipeline.exec_ready.drain() {
            debug!(task = %task.id(), "tarea {} entra al pilot", task.name());
            self.in_flight.push(InFlight { task, unit: None });
        }
    }

    async fn step_in_flight(&mut self, pilot: &dyn Pilot) {
        let entries = mem::take(&mut self.in_flight);
        for mut entry in entries {
            if let Some(unit) = &entry.unit {
                poll_unit(&mut entry.task, unit.as_ref()).await;
            } else if entry.task.state() == TaskState::WaitingForExecution {
                match submit(&entry.task, pilot).await {
                    Ok(unit) => {
                        debug!(task = %entry.task.id(), unit = %unit.id(), "tarea {} enviada", entry.task.name());
                        entry.unit = Some(unit);
                        entry.task.set_state(TaskState::Pending);
                    }
                    Err(e) => {
                        warn!(task = %entry.task.id(), "submit de {} falló: {:#}", entry.task.name(), e);
                        entry.task.fail(format!("{:#}", e));
                    }
                }
            }

            match entry.task.state() {
                TaskState::WaitingForOutputTransfer => self.pipeline.output.push(entry.task),
                TaskState::Done => self.pipeline.finish_done(entry.task),
                TaskState::Failed => self.pipeline.finish_failed(entry.task),
                _ => self.in_flight.push(entry),
            }
        }
    }

    /// Cancela el pilot (best effort) y manda a `failed` lo que no llegó a correr.
    async fn shutdown(&mut self, pilot: &dyn Pilot) {
        match pilot.cancel().await {
            Ok(()) => self.with_allocation(|a| {
                a.append_log(format!("Pilot {} cancelado", pilot.id()));
                if !a.state().is_terminal() {
                    a.set_state(AllocationState::Done);
                }
            }),
            Err(e) => {
                warn!(pilot = %pilot.id(), "error cancelando el pilot: {:#}", e);
                self.breadcrumb(format!("Error cancelando el pilot {}: {:#}", pilot.id(), e));
            }
        }
        self.strand();
    }

    fn strand(&mut self) {
        let leftovers = mem::take(&mut self.in_flight)
            .into_iter()
            .map(|entry| entry.task)
            .chain(self.pipeline.exec_ready.drain());
        for mut task in leftovers {
            task.fail(STRANDED);
            self.pipeline.finish_failed(task);
        }
    }
}

fn unit_description(task: &Task) -> Result<UnitDescription> {
    let workdir = task
        .workdir_url()
        .ok_or_else(|| anyhow!("la tarea '{}' no tiene directorio remoto asignado", task.name()))?;
    Ok(UnitDescription {
        executable: task.executable().to_string(),
        arguments: task.arguments().to_vec(),
        environment: task.environment().clone(),
        working_directory: workdir.path().to_string(),
        cores: task.cores(),
        output: "STDOUT".to_string(),
        error: "STDERR".to_string(),
    })
}

async fn submit(task: &Task, pilot: &dyn Pilot) -> Result<Arc<dyn ComputeUnit>> {
    let description = unit_description(task)?;
    pilot
        .submit_unit(&description)
        .await
        .with_context(|| format!("no se pudo enviar la tarea '{}' al pilot", task.name()))
}

async fn poll_unit(task: &mut Task, unit: &dyn ComputeUnit) {
    match unit.state().await {
        Ok(raw) => match translate_remote(&raw) {
            RemoteStatus::Unrecognized(raw) => {
                task.fail(format!("estado remoto desconocido para la unidad {}: '{}'", unit.id(), raw))
            }
            status => {
                let has_output = !task.output().is_empty();
                task.set_state(status.task_state(has_output));
            }
        },
        Err(e) => task.fail(format!("{:#}", e)),
    }
}
