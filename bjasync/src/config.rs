use std::{env, time::Duration};

pub const DEFAULT_INPUT_WORKERS: usize = 4;
pub const DEFAULT_OUTPUT_WORKERS: usize = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_WATCHDOG_GRACE_SECS: u64 = 60;

/// Parámetros de ejecución del pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Tamaño del pool de staging de entrada
    pub input_workers: usize,
    /// Tamaño del pool de staging de salida
    pub output_workers: usize,
    /// Espera entre pasadas cuando una cola está vacía
    pub poll_interval: Duration,
    /// Margen sobre el runtime pedido antes de forzar el apagado
    pub watchdog_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_workers: DEFAULT_INPUT_WORKERS,
            output_workers: DEFAULT_OUTPUT_WORKERS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            watchdog_grace: Duration::from_secs(DEFAULT_WATCHDOG_GRACE_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl Settings {
    /// Lee BJASYNC_INPUT_WORKERS, BJASYNC_OUTPUT_WORKERS,
    /// BJASYNC_POLL_INTERVAL_MS y BJASYNC_WATCHDOG_GRACE_SECS.
    pub fn from_env() -> Self {
        let input_workers = env_parse::<usize>("BJASYNC_INPUT_WORKERS")
            .unwrap_or(DEFAULT_INPUT_WORKERS)
            .max(1);
        let output_workers = env_parse::<usize>("BJASYNC_OUTPUT_WORKERS")
            .unwrap_or(DEFAULT_OUTPUT_WORKERS)
            .max(1);
        let poll_ms = env_parse::<u64>("BJASYNC_POLL_INTERVAL_MS")
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(1);
        let grace_secs =
            env_parse::<u64>("BJASYNC_WATCHDOG_GRACE_SECS").unwrap_or(DEFAULT_WATCHDOG_GRACE_SECS);

        Self {
            input_workers,
            output_workers,
            poll_interval: Duration::from_millis(poll_ms),
            watchdog_grace: Duration::from_secs(grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_respeta_variables_y_defaults() {
        env::set_var("BJASYNC_INPUT_WORKERS", "2");
        env::set_var("BJASYNC_OUTPUT_WORKERS", "0");
        env::set_var("BJASYNC_POLL_INTERVAL_MS", "no-es-numero");
        env::remove_var("BJASYNC_WATCHDOG_GRACE_SECS");

        let s = Settings::from_env();
        assert_eq!(s.input_workers, 2);
        // 0 workers no tiene sentido: mínimo 1
        assert_eq!(s.output_workers, 1);
        assert_eq!(s.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(s.watchdog_grace, Duration::from_secs(60));

        env::remove_var("BJASYNC_INPUT_WORKERS");
        env::remove_var("BJASYNC_OUTPUT_WORKERS");
        env::remove_var("BJASYNC_POLL_INTERVAL_MS");
    }
}
