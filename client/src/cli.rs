use anyhow::{Context, Result};
use bjasync::{
    AllocationRequest, AllocationState, AllocationSupervisor, BackendKind, ResourceTable,
    Settings, Task, TaskState,
};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf};
use tracing::{info, warn};

use crate::workload::{dispatch, Workload};

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Corre una carga de trabajo sobre uno o más pilots")]
pub struct Cli {
    /// Archivo JSON con la tabla de recursos
    #[arg(long = "resources", global = true, env = "BJASYNC_RESOURCES")]
    pub resources_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Lista los recursos conocidos
    Resources,

    /// Lanza una asignación por recurso y reparte las tareas del workload
    Run {
        /// Recurso a usar; repetir el flag para repartir entre varios
        #[arg(id = "resource", long = "resource", default_value = "localhost")]
        resources: Vec<String>,

        /// Archivo JSON con las tareas
        #[arg(long, value_name = "WORKLOAD_JSON")]
        workload: PathBuf,

        /// Minutos de runtime pedidos a cada pilot
        #[arg(long, default_value_t = 10)]
        runtime: u64,

        #[arg(long, default_value_t = 1)]
        cores: u32,

        /// Directorio base en el filesystem del recurso
        #[arg(long, env = "BJASYNC_WORKDIR")]
        workdir: Option<String>,

        #[arg(long, env = "BJASYNC_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "BJASYNC_PROJECT")]
        project: Option<String>,

        /// Pisa la cola del recurso
        #[arg(long)]
        queue: Option<String>,

        /// local | agent
        #[arg(long, default_value = "local", env = "BJASYNC_BACKEND")]
        backend: BackendKind,

        /// No apagar el pilot cuando la cola se vacía (corre hasta el watchdog)
        #[arg(long)]
        keep_alive: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let table = match &cli.resources_file {
        Some(path) => ResourceTable::load(path)?,
        None => ResourceTable::load_default()?,
    };

    match cli.command {
        Commands::Resources => {
            for (name, r) in table.iter() {
                println!("{}", name);
                println!("  broker: {}", r.broker_host);
                println!("  job manager: {} (cola {})", r.job_manager_url, r.job_manager_queue);
                println!("  filesystem: {}", r.shared_fs_url);
                if let Some(inc) = r.core_increment {
                    println!("  incremento de cores: {}", inc);
                }
            }
            Ok(())
        }
        Commands::Run {
            resources,
            workload,
            runtime,
            cores,
            workdir,
            username,
            project,
            queue,
            backend,
            keep_alive,
        } => {
            let workdir = workdir.unwrap_or_else(default_workdir);
            let requests = resources
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let resource = table.get(name)?.clone();
                    let mut req = AllocationRequest::new(
                        format!("{}-{}", name, i),
                        resource,
                        workdir.clone(),
                    );
                    req.runtime_minutes = runtime;
                    req.cores = cores;
                    req.username = username.clone();
                    req.project_id = project.clone();
                    req.queue = queue.clone();
                    req.backend = backend;
                    Ok(req)
                })
                .collect::<Result<Vec<_>>>()?;

            let tasks = Workload::load(&workload)?.build()?;
            let failed = run_workload(requests, tasks, !keep_alive).await?;
            if failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn default_workdir() -> String {
    env::temp_dir().join("bjasync").to_string_lossy().to_string()
}

fn print_task_change(task: &Task, from: TaskState, to: TaskState) {
    println!(
        "* Tarea {} cambió de estado '{}' a '{}'",
        task.name(),
        from,
        to
    );
    if to == TaskState::Failed {
        for line in task.log() {
            println!("    {}", line);
        }
    }
}

/// Lanza una asignación por pedido, reparte las tareas y espera a todas.
/// Devuelve cuántas tareas fallaron.
pub async fn run_workload(
    requests: Vec<AllocationRequest>,
    mut tasks: Vec<Task>,
    terminate_on_empty_queue: bool,
) -> Result<usize> {
    let settings = Settings::from_env();

    let mut supervisors = Vec::with_capacity(requests.len());
    for req in requests {
        let name = req.name.clone();
        let sup = AllocationSupervisor::new(req, settings.clone())
            .with_context(|| format!("no se pudo crear la asignación '{}'", name))?;
        sup.register_callback(|alloc, from, to| {
            println!(
                "* Asignación {} cambió de estado '{}' a '{}'",
                alloc.name(),
                from,
                to
            );
            if to == AllocationState::Failed {
                for line in alloc.log() {
                    println!("    {}", line);
                }
            }
        });
        supervisors.push(sup);
    }

    for task in &mut tasks {
        task.register_callback(print_task_change);
    }

    for sup in &supervisors {
        sup.allocate(terminate_on_empty_queue)?;
    }

    let batches = dispatch(tasks, supervisors.len());
    for (sup, batch) in supervisors.iter().zip(batches) {
        info!("{} tareas para la asignación {}", batch.len(), sup.name());
        sup.schedule_tasks(batch)?;
    }

    let mut done = 0;
    let mut failed = 0;
    for sup in &supervisors {
        if let Err(e) = sup.wait().await {
            warn!("error esperando la asignación {}: {:#}", sup.name(), e);
        }
        done += sup.done_tasks().len();
        failed += sup.failed_tasks().len();
    }

    println!("Resumen: {} tareas terminadas, {} fallidas", done, failed);
    Ok(failed)
}
