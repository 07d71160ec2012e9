// agent/src/state.rs

use bjasync::pilot::{
    local::LocalPilot,
    wire::{PilotId, UnitId},
    ComputeUnit, PilotDescription,
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

#[derive(Clone)]
pub struct AppState {
    pub pilots: Arc<Mutex<HashMap<PilotId, PilotEntry>>>,
    pub units: Arc<Mutex<HashMap<UnitId, UnitEntry>>>,
    pub hostname: String,
    // cuánto se guarda un pilot terminado antes de olvidarlo
    pub retention: Duration,
}

impl AppState {
    pub fn new(hostname: String, retention: Duration) -> Self {
        Self {
            pilots: Arc::new(Mutex::new(HashMap::new())),
            units: Arc::new(Mutex::new(HashMap::new())),
            hostname,
            retention,
        }
    }
}

#[derive(Clone)]
pub struct PilotEntry {
    pub pilot: Arc<LocalPilot>,
    pub description: PilotDescription,
    pub created_at: DateTime<Utc>,
    pub units: Vec<UnitId>,
    pub last_state: String,
    pub finished_at: Option<SystemTime>,
}

#[derive(Clone)]
pub struct UnitEntry {
    pub pilot_id: PilotId,
    pub unit: Arc<dyn ComputeUnit>,
}

/// Estados de pilot que ya no cambian.
pub fn is_final_state(state: &str) -> bool {
    matches!(state, "Done" | "Canceled" | "Failed")
}

/// Un lock envenenado no tira abajo al agent.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
