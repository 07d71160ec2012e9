//! Orquestación asíncrona de tareas sobre pilot jobs.
//!
//! Una `AllocationSupervisor` pide un pilot sobre un recurso y mueve cada
//! `Task` por el pipeline: staging de entrada, ejecución dentro del pilot,
//! staging de salida. Cada cambio de estado se avisa por callbacks.

pub mod allocation;
pub mod config;
pub mod directive;
pub mod fs;
pub mod pilot;
pub mod queue;
pub mod resource;
pub mod staging;
pub mod state;
pub mod supervisor;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

/* --------- Re-exports para el que llama --------- */

pub use allocation::{Allocation, AllocationCallback, AllocationRequest};
pub use config::Settings;
pub use directive::{InputDirective, InputOrigin, OutputDestination, OutputDirective, TransferMode};
pub use pilot::BackendKind;
pub use resource::{ResourceDescriptor, ResourceTable};
pub use state::{AllocationState, TaskState};
pub use supervisor::AllocationSupervisor;
pub use task::{Task, TaskCallback, TaskId, TaskRef};
