use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/* --------- API HTTP del agent (compartida con el backend "agent") --------- */

pub type PilotId = String;
pub type UnitId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePilotResponse {
    pub pilot_id: PilotId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotStatus {
    pub pilot_id: PilotId,
    pub state: String,
    pub hostname: String,
    pub cores: u32,
    pub walltime_minutes: u64,
    pub created_at: DateTime<Utc>,
    pub units: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitUnitResponse {
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub unit_id: UnitId,
    pub pilot_id: PilotId,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
}
