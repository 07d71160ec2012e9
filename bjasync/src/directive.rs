use serde::{Deserialize, Serialize};

use crate::task::TaskRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Copy,
    Link,
}

/// De dónde sale un archivo de entrada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOrigin {
    /// Filesystem local del que llama.
    Local,
    /// Un path que ya vive en el filesystem remoto.
    Remote,
    /// Un path relativo al directorio de trabajo de otra tarea.
    Task(TaskRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDirective {
    pub mode: TransferMode,
    pub origin: InputOrigin,
    pub origin_path: String,
}

impl InputDirective {
    pub fn copy_local(path: impl Into<String>) -> Self {
        Self {
            mode: TransferMode::Copy,
            origin: InputOrigin::Local,
            origin_path: path.into(),
        }
    }

    pub fn remote(mode: TransferMode, path: impl Into<String>) -> Self {
        Self {
            mode,
            origin: InputOrigin::Remote,
            origin_path: path.into(),
        }
    }

    pub fn from_task(producer: TaskRef, mode: TransferMode, path: impl Into<String>) -> Self {
        Self {
            mode,
            origin: InputOrigin::Task(producer),
            origin_path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDestination {
    Local,
    Remote,
}

/// Copia `origin_path` (relativo al directorio de la tarea) hacia el destino.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirective {
    #[serde(default = "default_output_mode")]
    pub mode: TransferMode,
    pub origin_path: String,
    pub destination: OutputDestination,
    pub destination_path: String,
}

fn default_output_mode() -> TransferMode {
    TransferMode::Copy
}

impl OutputDirective {
    pub fn to_local(origin_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            mode: TransferMode::Copy,
            origin_path: origin_path.into(),
            destination: OutputDestination::Local,
            destination_path: destination_path.into(),
        }
    }

    pub fn to_remote(origin_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            mode: TransferMode::Copy,
            origin_path: origin_path.into(),
            destination: OutputDestination::Remote,
            destination_path: destination_path.into(),
        }
    }
}
