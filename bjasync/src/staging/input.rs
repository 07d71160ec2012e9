use anyhow::{anyhow, bail, Context, Result};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use super::local_file_url;
use crate::directive::{InputDirective, InputOrigin, TransferMode};
use crate::fs::{join_path, DirHandle, RemoteFs};
use crate::queue::{Pipeline, ProducerState};
use crate::state::TaskState;
use crate::task::{Task, TaskRef};

/// Worker de staging de entrada. Toma tareas de la cola de entrada, crea su
/// directorio remoto, ejecuta las directivas en orden y las deja en la cola
/// de ejecución.
pub struct InputStager {
    id: usize,
    fs: Arc<dyn RemoteFs>,
    pipeline: Arc<Pipeline>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl InputStager {
    pub(crate) fn new(
        id: usize,
        fs: Arc<dyn RemoteFs>,
        pipeline: Arc<Pipeline>,
        stop: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            fs,
            pipeline,
            stop,
            poll_interval,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn run(self) {
        info!(worker = self.id, "input stager iniciado");

        while !self.stopped() {
            let mut deferred = Vec::new();
            let mut staged = 0usize;

            while !self.stopped() {
                let Some(task) = self.pipeline.input.try_pop() else {
                    break;
                };
                if let Some(producer) = self.pending_producer(&task) {
                    debug!(
                        worker = self.id,
                        task = %task.id(),
                        "tarea {} espera a su productora {}",
                        task.name(),
                        producer.name
                    );
                    deferred.push(task);
                    continue;
                }
                self.stage(task).await;
                staged += 1;
            }

            // las diferidas vuelven a la cola después de la pasada
            for task in deferred {
                self.pipeline.input.push(task);
            }

            if staged == 0 {
                sleep(self.poll_interval).await;
            }
        }

        info!(worker = self.id, "input stager detenido");
    }

    /// Primera productora (de otra tarea) que todavía no terminó.
    fn pending_producer(&self, task: &Task) -> Option<TaskRef> {
        task.input().iter().find_map(|d| match &d.origin {
            InputOrigin::Task(producer) if producer.id != task.id() => {
                match self.pipeline.producer(&producer.id) {
                    Some(ProducerState::Scheduled(_)) => Some(producer.clone()),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Ejecuta el staging y enruta la tarea: cola de ejecución o `failed`.
    pub(crate) async fn stage(&self, mut task: Task) {
        match self.stage_input(&mut task).await {
            Ok(()) => {
                task.set_state(TaskState::WaitingForExecution);
                debug!(worker = self.id, task = %task.id(), "tarea {} lista para ejecutar", task.name());
                self.pipeline.exec_ready.push(task);
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    task = %task.id(),
                    "staging de entrada falló para {}: {:#}",
                    task.name(),
                    e
                );
                task.fail(format!("{:#}", e));
                self.pipeline.finish_failed(task);
            }
        }
    }

    async fn stage_input(&self, task: &mut Task) -> Result<()> {
        task.set_state(TaskState::TransferringInput);

        let base = task
            .remote_workdir_url()
            .cloned()
            .ok_or_else(|| anyhow!("la tarea '{}' no tiene directorio remoto asignado", task.name()))?;
        let workdir = join_path(&base, &format!("{}/", task.dir_name()));

        task.append_log(format!("Creando directorio de trabajo {}", workdir));
        self.fs
            .create_dir(&workdir, true)
            .await
            .with_context(|| format!("no se pudo crear el directorio de trabajo {}", workdir))?;

        let mut handle = self
            .fs
            .open_dir(&workdir)
            .await
            .with_context(|| format!("no se pudo abrir el directorio de trabajo {}", workdir))?;

        let directives = task.input().to_vec();
        for directive in &directives {
            self.run_directive(task, &base, handle.as_mut(), directive)
                .await?;
        }

        if let Err(e) = handle.close().await {
            // el contenido ya está copiado; sólo queda registrado
            warn!(worker = self.id, task = %task.id(), "error cerrando {}: {:#}", workdir, e);
            task.append_log(format!("Error cerrando {}: {:#}", workdir, e));
        }
        Ok(())
    }

    async fn run_directive(
        &self,
        task: &mut Task,
        base: &Url,
        handle: &mut dyn DirHandle,
        directive: &InputDirective,
    ) -> Result<()> {
        let target = handle.url().clone();
        let path = &directive.origin_path;

        let (source, label) = match &directive.origin {
            InputOrigin::Local => {
                if directive.mode == TransferMode::Link {
                    bail!("no se puede enlazar un archivo LOCAL ({}): sólo se admite copia", path);
                }
                (local_file_url(path)?, "LOCAL".to_string())
            }
            InputOrigin::Remote => (join_path(base, path), "REMOTE".to_string()),
            InputOrigin::Task(producer) => {
                let producer_dir = self.producer_workdir(task, producer)?;
                (join_path(&producer_dir, path), format!("de la tarea {}", producer.name))
            }
        };

        match directive.mode {
            TransferMode::Copy => {
                task.append_log(format!(
                    "Copiando archivo de entrada {} {} a {}",
                    label, source, target
                ));
                handle
                    .copy(&source, &target)
                    .await
                    .with_context(|| format!("no se pudo copiar {} a {}", source, target))
            }
            TransferMode::Link => {
                task.append_log(format!(
                    "Enlazando archivo de entrada {} {} en {}",
                    label, source, target
                ));
                handle
                    .link(&source, &target)
                    .await
                    .with_context(|| format!("no se pudo enlazar {} en {}", source, target))
            }
        }
    }

    fn producer_workdir(&self, task: &Task, producer: &TaskRef) -> Result<Url> {
        if producer.id == task.id() {
            bail!("la tarea '{}' no puede leer de su propio directorio como productora", task.name());
        }
        match self.pipeline.producer(&producer.id) {
            Some(ProducerState::Done(dir)) => Ok(dir),
            Some(ProducerState::Failed) => {
                bail!("la tarea productora '{}' ({}) falló", producer.name, producer.id)
            }
            Some(ProducerState::Scheduled(_)) => {
                bail!("la tarea productora '{}' ({}) todavía no terminó", producer.name, producer.id)
            }
            None => bail!(
                "la tarea productora '{}' ({}) no pertenece a esta asignación",
                producer.name,
                producer.id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FsOp, MemoryFs};
    use std::sync::Mutex;

    fn base() -> Url {
        Url::parse("sftp://stampede.tacc.utexas.edu/scratch/bja/").unwrap()
    }

    fn stager(fs: &MemoryFs, pipeline: &Arc<Pipeline>) -> InputStager {
        InputStager::new(
            0,
            Arc::new(fs.clone()),
            pipeline.clone(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(1),
        )
    }

    fn admitted(pipeline: &Pipeline, mut task: Task) -> (Task, Arc<Mutex<Vec<TaskState>>>) {
        task.assign_remote_workdir(base()).unwrap();
        let seen = Arc::new(Mutex::new(vec![task.state()]));
        let seen_cb = seen.clone();
        task.register_callback(move |_, _, new| seen_cb.lock().unwrap().push(new));
        pipeline.register(&task);
        pipeline.admit(task);
        (pipeline.input.try_pop().unwrap(), seen)
    }

    #[tokio::test]
    async fn directivas_en_orden_y_tarea_lista() {
        let fs = MemoryFs::new();
        let pipeline = Arc::new(Pipeline::new());
        let task = Task::new("t", "/bin/cat").with_input(vec![
            InputDirective::copy_local("/tmp/a.txt"),
            InputDirective::remote(TransferMode::Link, "shared/ref.db"),
        ]);
        let (task, seen) = admitted(&pipeline, task);
        let workdir = task.workdir_url().unwrap().to_string();

        stager(&fs, &pipeline).stage(task).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TaskState::New,
                TaskState::TransferringInput,
                TaskState::WaitingForExecution
            ]
        );
        assert_eq!(
            fs.ops(),
            vec![
                FsOp::CreateDir(workdir.clone()),
                FsOp::Open(workdir.clone()),
                FsOp::Copy {
                    source: "file:///tmp/a.txt".to_string(),
                    target: workdir.clone(),
                },
                FsOp::Link {
                    source: "sftp://stampede.tacc.utexas.edu/scratch/bja/shared/ref.db".to_string(),
                    target: workdir.clone(),
                },
                FsOp::Close(workdir),
            ]
        );
        assert_eq!(pipeline.exec_ready.len(), 1);
        assert!(pipeline.failed.is_empty());
    }

    #[tokio::test]
    async fn si_falla_a_nunca_se_intenta_b() {
        let fs = MemoryFs::new();
        fs.fail_on("alpha.txt");
        let pipeline = Arc::new(Pipeline::new());
        let task = Task::new("t", "/bin/cat").with_input(vec![
            InputDirective::copy_local("/tmp/alpha.txt"),
            InputDirective::copy_local("/tmp/beta.txt"),
        ]);
        let (task, seen) = admitted(&pipeline, task);

        stager(&fs, &pipeline).stage(task).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TaskState::New, TaskState::TransferringInput, TaskState::Failed]
        );
        assert!(fs.ops().iter().all(|op| !op.to_string().contains("beta.txt")));
        assert!(pipeline.exec_ready.is_empty());

        let failed = pipeline.failed.try_pop().unwrap();
        assert!(failed.log().iter().all(|l| !l.contains("beta.txt")));
        assert!(failed.log().last().unwrap().contains("alpha.txt"));
        assert_eq!(pipeline.outstanding(), 0);
    }

    #[tokio::test]
    async fn link_local_no_esta_soportado() {
        let fs = MemoryFs::new();
        let pipeline = Arc::new(Pipeline::new());
        let task = Task::new("t", "/bin/cat").with_input(vec![InputDirective {
            mode: TransferMode::Link,
            origin: InputOrigin::Local,
            origin_path: "/tmp/a.txt".to_string(),
        }]);
        let (task, _) = admitted(&pipeline, task);

        stager(&fs, &pipeline).stage(task).await;

        let failed = pipeline.failed.try_pop().unwrap();
        assert_eq!(failed.state(), TaskState::Failed);
        assert!(failed.log().last().unwrap().contains("LOCAL"));
    }

    #[tokio::test]
    async fn error_creando_directorio_falla_la_tarea() {
        let fs = MemoryFs::new();
        fs.fail_on("create_dir");
        let pipeline = Arc::new(Pipeline::new());
        let (task, _) = admitted(
            &pipeline,
            Task::new("t", "/bin/true").with_input(vec![InputDirective::copy_local("/tmp/a")]),
        );

        stager(&fs, &pipeline).stage(task).await;

        assert_eq!(fs.ops().len(), 1);
        assert_eq!(pipeline.failed.len(), 1);
    }

    #[tokio::test]
    async fn error_al_cerrar_solo_queda_en_el_log() {
        let fs = MemoryFs::new();
        fs.fail_on("close");
        let pipeline = Arc::new(Pipeline::new());
        let (task, _) = admitted(&pipeline, Task::new("t", "/bin/true"));

        stager(&fs, &pipeline).stage(task).await;

        let ready = pipeline.exec_ready.try_pop().unwrap();
        assert_eq!(ready.state(), TaskState::WaitingForExecution);
        assert!(ready.log().last().unwrap().starts_with("Error cerrando"));
    }

    #[tokio::test]
    async fn productora_terminada_se_lee_de_su_directorio() {
        let fs = MemoryFs::new();
        let pipeline = Arc::new(Pipeline::new());

        let (producer, _) = admitted(&pipeline, Task::new("producer", "/bin/true"));
        let producer_dir = producer.workdir_url().unwrap();
        let consumer = Task::new("consumer", "/bin/cat").with_input(vec![
            InputDirective::from_task(producer.reference(), TransferMode::Copy, "STDOUT"),
        ]);
        let (consumer, _) = admitted(&pipeline, consumer);

        let s = stager(&fs, &pipeline);
        assert!(s.pending_producer(&consumer).is_some());

        pipeline.finish_done(producer);
        assert!(s.pending_producer(&consumer).is_none());
        s.stage(consumer).await;

        let expected = join_path(&producer_dir, "STDOUT").to_string();
        assert!(fs
            .ops()
            .iter()
            .any(|op| matches!(op, FsOp::Copy { source, .. } if *source == expected)));
        assert_eq!(pipeline.exec_ready.len(), 1);
    }

    #[tokio::test]
    async fn productora_desconocida_o_fallida_falla_la_dependiente() {
        let fs = MemoryFs::new();
        let pipeline = Arc::new(Pipeline::new());

        let stranger = Task::new("stranger", "/bin/true");
        let (orphan, _) = admitted(
            &pipeline,
            Task::new("orphan", "/bin/cat").with_input(vec![InputDirective::from_task(
                stranger.reference(),
                TransferMode::Link,
                "out.dat",
            )]),
        );
        stager(&fs, &pipeline).stage(orphan).await;
        let failed = pipeline.failed.try_pop().unwrap();
        assert!(failed.log().last().unwrap().contains("no pertenece"));

        let (producer, _) = admitted(&pipeline, Task::new("producer", "/bin/false"));
        let (dependent, _) = admitted(
            &pipeline,
            Task::new("dependent", "/bin/cat").with_input(vec![InputDirective::from_task(
                producer.reference(),
                TransferMode::Copy,
                "out.dat",
            )]),
        );
        pipeline.finish_failed(producer);
        stager(&fs, &pipeline).stage(dependent).await;

        let failed: Vec<Task> = pipeline.failed.drain();
        let dependent = failed.iter().find(|t| t.name() == "dependent").unwrap();
        assert_eq!(dependent.state(), TaskState::Failed);
        assert!(dependent.log().last().unwrap().contains("falló"));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_difiere_a_la_dependiente_hasta_que_termina_la_productora() {
        let fs = MemoryFs::new();
        let pipeline = Arc::new(Pipeline::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mut producer = Task::new("producer", "/bin/true");
        producer.assign_remote_workdir(base()).unwrap();
        let producer_ref = producer.reference();
        pipeline.register(&producer);

        let mut consumer = Task::new("consumer", "/bin/cat").with_input(vec![
            InputDirective::from_task(producer_ref.clone(), TransferMode::Copy, "STDOUT"),
        ]);
        consumer.assign_remote_workdir(base()).unwrap();
        pipeline.register(&consumer);
        pipeline.admit(consumer);

        let worker = tokio::spawn(
            InputStager::new(
                1,
                Arc::new(fs.clone()),
                pipeline.clone(),
                stop.clone(),
                Duration::from_secs(1),
            )
            .run(),
        );

        sleep(Duration::from_secs(5)).await;
        // sigue diferida: ni se tocó el filesystem
        assert!(fs.ops().is_empty());
        assert_eq!(pipeline.input.len(), 1);

        pipeline.admit(producer);
        sleep(Duration::from_secs(3)).await;
        let producer = pipeline.exec_ready.try_pop().unwrap();
        assert_eq!(producer.name(), "producer");
        pipeline.finish_done(producer);

        sleep(Duration::from_secs(3)).await;
        let consumer = pipeline.exec_ready.try_pop().unwrap();
        assert_eq!(consumer.name(), "consumer");
        assert_eq!(consumer.state(), TaskState::WaitingForExecution);

        stop.store(true, Ordering::SeqCst);
        worker.await.unwrap();
    }
}
