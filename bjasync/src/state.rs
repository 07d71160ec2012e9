use serde::{Deserialize, Serialize};
use std::fmt;

/* --------- Estados de una tarea --------- */

/// Estados de una tarea, en el orden del pipeline.
/// `Failed` se alcanza desde cualquier estado no terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    New,
    TransferringInput,
    WaitingForExecution,
    Pending,
    Running,
    WaitingForOutputTransfer,
    TransferringOutput,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    // posición dentro del pipeline (Failed queda fuera del orden)
    fn rank(self) -> u8 {
        match self {
            TaskState::New => 0,
            TaskState::TransferringInput => 1,
            TaskState::WaitingForExecution => 2,
            TaskState::Pending => 3,
            TaskState::Running => 4,
            TaskState::WaitingForOutputTransfer => 5,
            TaskState::TransferringOutput => 6,
            TaskState::Done => 7,
            TaskState::Failed => u8::MAX,
        }
    }

    /// Una transición es válida si avanza en el pipeline (saltarse etapas está
    /// permitido) o si va a `Failed` desde un estado no terminal.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == TaskState::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "New",
            TaskState::TransferringInput => "TransferringInput",
            TaskState::WaitingForExecution => "WaitingForExecution",
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::WaitingForOutputTransfer => "WaitingForOutputTransfer",
            TaskState::TransferringOutput => "TransferringOutput",
            TaskState::Done => "Done",
            TaskState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/* --------- Estados de una asignación (pilot) --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationState {
    New,
    Pending,
    Running,
    Done,
    Failed,
}

impl AllocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AllocationState::Done | AllocationState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            AllocationState::New => 0,
            AllocationState::Pending => 1,
            AllocationState::Running => 2,
            AllocationState::Done => 3,
            AllocationState::Failed => u8::MAX,
        }
    }

    pub fn can_transition_to(self, next: AllocationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == AllocationState::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationState::New => "New",
            AllocationState::Pending => "Pending",
            AllocationState::Running => "Running",
            AllocationState::Done => "Done",
            AllocationState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/* --------- Traducción del vocabulario remoto --------- */

/// Estado reportado por el servicio de pilots, ya normalizado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Running,
    Done,
    /// Cualquier otra cosa. Se guarda el texto tal cual llegó.
    Unrecognized(String),
}

/// Traduce el string remoto. Nunca interpreta algo desconocido como éxito.
pub fn translate_remote(raw: &str) -> RemoteStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "unknown" | "new" => RemoteStatus::Pending,
        "running" => RemoteStatus::Running,
        "done" => RemoteStatus::Done,
        _ => RemoteStatus::Unrecognized(raw.to_string()),
    }
}

impl RemoteStatus {
    pub fn allocation_state(&self) -> AllocationState {
        match self {
            RemoteStatus::Pending => AllocationState::Pending,
            RemoteStatus::Running => AllocationState::Running,
            RemoteStatus::Done => AllocationState::Done,
            RemoteStatus::Unrecognized(_) => AllocationState::Failed,
        }
    }

    /// `done` pasa a `WaitingForOutputTransfer` si la tarea tiene directivas
    /// de salida; si no, directo a `Done`.
    pub fn task_state(&self, has_output: bool) -> TaskState {
        match self {
            RemoteStatus::Pending => TaskState::Pending,
            RemoteStatus::Running => TaskState::Running,
            RemoteStatus::Done if has_output => TaskState::WaitingForOutputTransfer,
            RemoteStatus::Done => TaskState::Done,
            RemoteStatus::Unrecognized(_) => TaskState::Failed,
        }
    }
}
