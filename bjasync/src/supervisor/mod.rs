//! Supervisor de una asignación: dueño de las cinco colas, de los pools de
//! staging y del supervisor del pilot. Es la superficie que usa el que llama.

mod pilot;

use anyhow::{bail, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{info, warn};
use url::Url;

use crate::allocation::{Allocation, AllocationCallback, AllocationRequest};
use crate::config::Settings;
use crate::fs::{LocalFs, RemoteFs};
use crate::pilot::PilotBackend;
use crate::queue::{Pipeline, TaskQueue};
use crate::staging::{InputStager, OutputStager};
use crate::state::{AllocationState, TaskState};
use crate::task::Task;

use self::pilot::PilotSupervisor;

/// Entrada de log de las tareas que quedaron sin correr al apagarse el pilot.
pub const STRANDED: &str = "allocation terminated before the task could run";

struct Workers {
    terminate_on_empty_queue: bool,
    pilot: JoinHandle<()>,
    input: Vec<JoinHandle<()>>,
    output: Vec<JoinHandle<()>>,
}

pub struct AllocationSupervisor {
    allocation: Arc<Mutex<Allocation>>,
    fs: Arc<dyn RemoteFs>,
    backend: Arc<dyn PilotBackend>,
    settings: Settings,
    pipeline: Arc<Pipeline>,

    pilot_stop: Arc<AtomicBool>,
    input_stop: Arc<AtomicBool>,
    output_stop: Arc<AtomicBool>,

    allocated: AtomicBool,
    // false una vez que empezó el apagado
    accepting: Mutex<bool>,
    workers: Mutex<Option<Workers>>,
}

impl AllocationSupervisor {
    /// Filesystem local y el backend que pide la asignación.
    pub fn new(request: AllocationRequest, settings: Settings) -> Result<Self> {
        let backend = request.backend.build()?;
        Self::with_collaborators(request, Arc::new(LocalFs::new()), backend, settings)
    }

    pub fn with_collaborators(
        request: AllocationRequest,
        fs: Arc<dyn RemoteFs>,
        backend: Arc<dyn PilotBackend>,
        settings: Settings,
    ) -> Result<Self> {
        let allocation = Allocation::new(request)?;
        info!(
            allocation = %allocation.name(),
            "asignación creada: {} cores, {} min, backend {}, directorio {}",
            allocation.cores(),
            allocation.runtime_minutes(),
            backend.name(),
            allocation.remote_workdir_url()
        );
        Ok(Self {
            allocation: Arc::new(Mutex::new(allocation)),
            fs,
            backend,
            settings,
            pipeline: Arc::new(Pipeline::new()),
            pilot_stop: Arc::new(AtomicBool::new(false)),
            input_stop: Arc::new(AtomicBool::new(false)),
            output_stop: Arc::new(AtomicBool::new(false)),
            allocated: AtomicBool::new(false),
            accepting: Mutex::new(true),
            workers: Mutex::new(None),
        })
    }

    fn allocation(&self) -> MutexGuard<'_, Allocation> {
        self.allocation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepting(&self) -> MutexGuard<'_, bool> {
        self.accepting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_workers(&self) -> Option<Workers> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn name(&self) -> String {
        self.allocation().name().to_string()
    }

    pub fn state(&self) -> AllocationState {
        self.allocation().state()
    }

    pub fn log(&self) -> Vec<String> {
        self.allocation().log().to_vec()
    }

    pub fn cores(&self) -> u32 {
        self.allocation().cores()
    }

    pub fn remote_workdir_url(&self) -> Url {
        self.allocation().remote_workdir_url().clone()
    }

    /// Los callbacks corren con la asignación bloqueada: no pueden volver a
    /// llamar a este supervisor.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Allocation, AllocationState, AllocationState) + Send + Sync + 'static,
    {
        self.allocation().register_callback(callback);
    }

    pub fn register_callbacks<I>(&self, callbacks: I)
    where
        I: IntoIterator<Item = AllocationCallback>,
    {
        self.allocation().register_callbacks(callbacks);
    }

    /// Arranca los pools de staging y el supervisor del pilot. No bloquea.
    /// Hay que llamarlo dentro de un runtime de tokio.
    pub fn allocate(&self, terminate_on_empty_queue: bool) -> Result<()> {
        if self.allocated.swap(true, Ordering::SeqCst) {
            bail!("la asignación '{}' ya fue lanzada", self.name());
        }

        let poll = self.settings.poll_interval;

        let input = (0..self.settings.input_workers)
            .map(|id| {
                let worker = InputStager::new(
                    id,
                    self.fs.clone(),
                    self.pipeline.clone(),
                    self.input_stop.clone(),
                    poll,
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let output = (0..self.settings.output_workers)
            .map(|id| {
                let worker = OutputStager::new(
                    id,
                    self.fs.clone(),
                    self.pipeline.clone(),
                    self.output_stop.clone(),
                    poll,
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let supervisor = PilotSupervisor::new(
            self.allocation.clone(),
            self.fs.clone(),
            self.backend.clone(),
            self.pipeline.clone(),
            self.pilot_stop.clone(),
            poll,
            self.settings.watchdog_grace,
        );
        let pilot = tokio::spawn(supervisor.run());

        info!(
            allocation = %self.name(),
            "asignación lanzada ({} input workers, {} output workers, terminar al vaciarse: {})",
            self.settings.input_workers,
            self.settings.output_workers,
            terminate_on_empty_queue
        );

        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = Some(Workers {
            terminate_on_empty_queue,
            pilot,
            input,
            output,
        });
        Ok(())
    }

    /// Asigna el directorio remoto a cada tarea y las encola. Todo el lote
    /// queda anotado como productor antes de encolar la primera.
    /// Sólo se admiten tareas en `New`; el resto va directo a `failed`.
    pub fn schedule_tasks<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        let accepting = self.accepting();
        if !*accepting {
            bail!("la asignación '{}' ya terminó; no acepta tareas", self.name());
        }

        let base = self.remote_workdir_url();
        let mut batch = Vec::new();
        for mut task in tasks {
            if task.state() != TaskState::New {
                warn!(
                    task = %task.id(),
                    "tarea {} rechazada: ya pasó por el pipeline (estado {})",
                    task.name(),
                    task.state()
                );
                task.fail(format!(
                    "la tarea ya pasó por el pipeline (estado {}); no se vuelve a agendar",
                    task.state()
                ));
                self.pipeline.reject(task);
                continue;
            }
            match task.assign_remote_workdir(base.clone()) {
                Ok(()) => batch.push(task),
                Err(e) => {
                    warn!(task = %task.id(), "tarea {} rechazada: {:#}", task.name(), e);
                    task.fail(format!("{:#}", e));
                    self.pipeline.reject(task);
                }
            }
        }

        for task in &batch {
            self.pipeline.register(task);
        }
        let count = batch.len();
        for task in batch {
            self.pipeline.admit(task);
        }
        info!(allocation = %self.name(), "{} tareas agendadas", count);
        Ok(())
    }

    /// Espera a que el pipeline se vacíe y apaga todo en orden.
    pub async fn wait(&self) -> Result<()> {
        let Some(workers) = self.take_workers() else {
            bail!("la asignación '{}' no fue lanzada (o ya se esperó)", self.name());
        };
        let poll = self.settings.poll_interval;

        if workers.terminate_on_empty_queue {
            while self.pipeline.outstanding() > 0 && !workers.pilot.is_finished() {
                sleep(poll).await;
            }
            self.pilot_stop.store(true, Ordering::SeqCst);
        }

        if let Err(e) = workers.pilot.await {
            warn!("el supervisor del pilot terminó con error: {}", e);
        }
        *self.accepting() = false;

        // nada más entra a la cola de ejecución
        self.input_stop.store(true, Ordering::SeqCst);
        for handle in workers.input {
            let _ = handle.await;
        }
        self.strand(&self.pipeline.input);
        self.strand(&self.pipeline.exec_ready);

        while self.pipeline.outstanding() > 0 {
            sleep(poll).await;
        }
        self.output_stop.store(true, Ordering::SeqCst);
        for handle in workers.output {
            let _ = handle.await;
        }

        info!(allocation = %self.name(), "asignación terminada en estado {}", self.state());
        Ok(())
    }

    fn strand(&self, queue: &TaskQueue) {
        for mut task in queue.drain() {
            task.fail(STRANDED);
            self.pipeline.finish_failed(task);
        }
    }

    /// Pide al supervisor del pilot que pare en la próxima vuelta.
    pub fn stop(&self) {
        *self.accepting() = false;
        self.pilot_stop.store(true, Ordering::SeqCst);
    }

    /// Saca las tareas terminadas bien.
    pub fn done_tasks(&self) -> Vec<Task> {
        self.pipeline.done.drain()
    }

    /// Saca las tareas fallidas.
    pub fn failed_tasks(&self) -> Vec<Task> {
        self.pipeline.failed.drain()
    }

    /// Tareas admitidas que todavía no llegaron a done/failed.
    pub fn outstanding(&self) -> usize {
        self.pipeline.outstanding()
    }
}

impl Drop for AllocationSupervisor {
    fn drop(&mut self) {
        self.pilot_stop.store(true, Ordering::SeqCst);
        self.input_stop.store(true, Ordering::SeqCst);
        self.output_stop.store(true, Ordering::SeqCst);
    }
}
