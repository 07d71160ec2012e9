use crate::state::{is_final_state, lock, AppState};
use bjasync::pilot::Pilot;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Consulta cada pilot periódicamente: así el walltime se aplica aunque nadie
/// esté preguntando. Los pilots terminados se olvidan después de `retention`.
pub async fn monitor_pilots(state: AppState, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        sweep(&state).await;
    }
}

pub async fn sweep(state: &AppState) {
    let now = SystemTime::now();

    let pilots: Vec<_> = lock(&state.pilots)
        .iter()
        .map(|(id, e)| (id.clone(), e.pilot.clone()))
        .collect();

    // consultar sin tener el lock tomado
    let mut observed = Vec::with_capacity(pilots.len());
    for (id, pilot) in pilots {
        if let Ok(s) = pilot.state().await {
            observed.push((id, s));
        }
    }

    let mut evicted = Vec::new();
    {
        let mut pilots = lock(&state.pilots);
        for (id, current) in observed {
            if let Some(entry) = pilots.get_mut(&id) {
                if entry.last_state != current {
                    debug!("pilot {}: {} -> {}", id, entry.last_state, current);
                    entry.last_state = current;
                }
                if is_final_state(&entry.last_state) && entry.finished_at.is_none() {
                    entry.finished_at = Some(now);
                }
            }
        }

        pilots.retain(|id, entry| {
            let expired = entry
                .finished_at
                .and_then(|t| now.duration_since(t).ok())
                .map(|age| age >= state.retention)
                .unwrap_or(false);
            if expired {
                evicted.push((id.clone(), entry.units.clone()));
            }
            !expired
        });
    }

    if evicted.is_empty() {
        return;
    }

    let mut units = lock(&state.units);
    for (pilot_id, unit_ids) in evicted {
        for unit_id in &unit_ids {
            units.remove(unit_id);
        }
        info!(
            "pilot {} olvidado ({} unidades) tras la retención",
            pilot_id,
            unit_ids.len()
        );
    }
}
