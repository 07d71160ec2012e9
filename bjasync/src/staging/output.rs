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

use super::local_target_url;
use crate::directive::{OutputDestination, OutputDirective, TransferMode};
use crate::fs::{join_path, DirHandle, RemoteFs};
use crate::queue::Pipeline;
use crate::state::TaskState;
use crate::task::Task;

/// Worker de staging de salida: copia los resultados de cada tarea a su destino.
pub struct OutputStager {
    id: usize,
    fs: Arc<dyn RemoteFs>,
    pipeline: Arc<Pipeline>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl OutputStager {
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

    pub async fn run(self) {
        info!(worker = self.id, "output stager iniciado");

        while !self.stop.load(Ordering::SeqCst) {
            match self.pipeline.output.try_pop() {
                Some(task) => self.stage(task).await,
                None => sleep(self.poll_interval).await,
            }
        }

        info!(worker = self.id, "output stager detenido");
    }

    pub(crate) async fn stage(&self, mut task: Task) {
        match self.stage_output(&mut task).await {
            Ok(()) => {
                task.set_state(TaskState::Done);
                debug!(worker = self.id, task = %task.id(), "tarea {} terminada", task.name());
                self.pipeline.finish_done(task);
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    task = %task.id(),
                    "staging de salida falló para {}: {:#}",
                    task.name(),
                    e
                );
                task.fail(format!("{:#}", e));
                self.pipeline.finish_failed(task);
            }
        }
    }

    async fn stage_output(&self, task: &mut Task) -> Result<()> {
        task.set_state(TaskState::TransferringOutput);

        let base = task
            .remote_workdir_url()
            .cloned()
            .ok_or_else(|| anyhow!("la tarea '{}' no tiene directorio remoto asignado", task.name()))?;
        let workdir = join_path(&base, &format!("{}/", task.dir_name()));

        let mut handle = self
            .fs
            .open_dir(&workdir)
            .await
            .with_context(|| format!("no se pudo abrir el directorio de trabajo {}", workdir))?;

        let directives = task.output().to_vec();
        for directive in &directives {
            self.run_directive(task, &base, handle.as_mut(), directive)
                .await?;
        }

        if let Err(e) = handle.close().await {
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
        directive: &OutputDirective,
    ) -> Result<()> {
        let source = join_path(handle.url(), &directive.origin_path);

        let (target, label) = match directive.destination {
            OutputDestination::Local => {
                if directive.mode == TransferMode::Link {
                    bail!(
                        "no se puede enlazar {} hacia el filesystem LOCAL: sólo se admite copia",
                        directive.origin_path
                    );
                }
                (local_target_url(&directive.destination_path)?, "LOCAL")
            }
            OutputDestination::Remote => (join_path(base, &directive.destination_path), "REMOTE"),
        };

        match directive.mode {
            TransferMode::Copy => {
                task.append_log(format!(
                    "Copiando archivo de salida {} a {} {}",
                    source, label, target
                ));
                handle
                    .copy(&source, &target)
                    .await
                    .with_context(|| format!("no se pudo copiar {} a {}", source, target))
            }
            TransferMode::Link => {
                task.append_log(format!(
                    "Enlazando archivo de salida {} en {} {}",
                    source, label, target
                ));
                handle
                    .link(&source, &target)
                    .await
                    .with_context(|| format!("no se pudo enlazar {} en {}", source, target))
            }
        }
    }
}
