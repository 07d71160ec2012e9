use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bjasync::pilot::{
    local::LocalPilot,
    wire::{CancelResponse, CreatePilotResponse, PilotStatus, SubmitUnitResponse, UnitStatus},
    Pilot, PilotDescription, UnitDescription,
};
use chrono::Utc;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{is_final_state, lock, AppState, PilotEntry, UnitEntry};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/pilots", post(create_pilot).get(list_pilots))
        .route("/api/v1/pilots/:id", get(get_pilot))
        .route("/api/v1/pilots/:id/units", post(submit_unit))
        .route("/api/v1/pilots/:id/cancel", post(cancel_pilot))
        .route("/api/v1/units/:id", get(get_unit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Arranca un pilot local con la descripción recibida
async fn create_pilot(
    State(state): State<AppState>,
    Json(desc): Json<PilotDescription>,
) -> Result<Json<CreatePilotResponse>, StatusCode> {
    let pilot = match LocalPilot::start(desc.clone()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!("pedido de pilot rechazado: {:#}", e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    let pilot_id = pilot.id();

    lock(&state.pilots).insert(
        pilot_id.clone(),
        PilotEntry {
            pilot,
            description: desc,
            created_at: Utc::now(),
            units: Vec::new(),
            last_state: "Running".to_string(),
            finished_at: None,
        },
    );

    info!("pilot {} creado", pilot_id);
    Ok(Json(CreatePilotResponse { pilot_id }))
}

async fn status_of(state: &AppState, id: &str, entry: PilotEntry) -> PilotStatus {
    let current = match entry.pilot.state().await {
        Ok(s) => s,
        Err(_) => entry.last_state.clone(),
    };
    PilotStatus {
        pilot_id: id.to_string(),
        state: current,
        hostname: state.hostname.clone(),
        cores: entry.description.cores,
        walltime_minutes: entry.description.walltime_minutes,
        created_at: entry.created_at,
        units: entry.units.len() as u32,
    }
}

async fn list_pilots(State(state): State<AppState>) -> Json<Vec<PilotStatus>> {
    let entries: Vec<(String, PilotEntry)> = lock(&state.pilots)
        .iter()
        .map(|(id, e)| (id.clone(), e.clone()))
        .collect();

    let mut out = Vec::with_capacity(entries.len());
    for (id, entry) in entries {
        out.push(status_of(&state, &id, entry).await);
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(out)
}

async fn get_pilot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PilotStatus>, StatusCode> {
    let entry = lock(&state.pilots).get(&id).cloned();
    match entry {
        Some(entry) => Ok(Json(status_of(&state, &id, entry).await)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn submit_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(desc): Json<UnitDescription>,
) -> Result<Json<SubmitUnitResponse>, StatusCode> {
    let pilot = lock(&state.pilots)
        .get(&id)
        .map(|e| e.pilot.clone())
        .ok_or(StatusCode::NOT_FOUND)?;

    let unit = match pilot.submit_unit(&desc).await {
        Ok(u) => u,
        Err(e) => {
            warn!("pilot {} rechazó la unidad {}: {:#}", id, desc.executable, e);
            return Err(StatusCode::CONFLICT);
        }
    };
    let unit_id = unit.id();

    lock(&state.units).insert(
        unit_id.clone(),
        UnitEntry {
            pilot_id: id.clone(),
            unit,
        },
    );
    if let Some(entry) = lock(&state.pilots).get_mut(&id) {
        entry.units.push(unit_id.clone());
    }

    info!(
        "unidad {} en pilot {}: {} {:?} ({} cores)",
        unit_id, id, desc.executable, desc.arguments, desc.cores
    );
    Ok(Json(SubmitUnitResponse { unit_id }))
}

async fn cancel_pilot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, StatusCode> {
    let pilot = lock(&state.pilots)
        .get(&id)
        .map(|e| e.pilot.clone())
        .ok_or(StatusCode::NOT_FOUND)?;

    if let Err(e) = pilot.cancel().await {
        warn!("error cancelando el pilot {}: {:#}", id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    if let Some(entry) = lock(&state.pilots).get_mut(&id) {
        if !is_final_state(&entry.last_state) {
            entry.last_state = "Canceled".to_string();
        }
    }
    Ok(Json(CancelResponse { ok: true }))
}

async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UnitStatus>, StatusCode> {
    let entry = lock(&state.units)
        .get(&id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;

    let unit_state = entry
        .unit
        .state()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(UnitStatus {
        unit_id: id,
        pilot_id: entry.pilot_id,
        state: unit_state,
    }))
}
