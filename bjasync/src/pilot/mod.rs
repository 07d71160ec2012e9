//! Primitiva del servicio de pilots: conectar, crear un pilot, consultar su
//! estado, enviarle unidades de cómputo y cancelarlo.
//!
//! Hay dos implementaciones y se elige una por asignación con `BackendKind`.

pub mod agent;
pub mod local;
pub mod wire;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use url::Url;

pub use agent::AgentBackend;
pub use local::LocalBackend;

/// Pedido de un pilot (una reserva de larga duración en el cluster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PilotDescription {
    pub service_url: String,
    pub cores: u32,
    pub walltime_minutes: u64,
    pub queue: String,
    #[serde(default)]
    pub project: Option<String>,
    pub working_directory: String,
    #[serde(default)]
    pub scheduler_variant: Option<String>,
}

/// Una unidad de cómputo (una tarea ya metida en el pilot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDescription {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub working_directory: String,
    pub cores: u32,
    /// Archivos (relativos al working_directory) para stdout y stderr.
    #[serde(default = "default_stdout")]
    pub output: String,
    #[serde(default = "default_stderr")]
    pub error: String,
}

fn default_stdout() -> String {
    "STDOUT".to_string()
}

fn default_stderr() -> String {
    "STDERR".to_string()
}

#[async_trait]
pub trait PilotBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, broker: &Url) -> Result<Arc<dyn PilotService>>;
}

#[async_trait]
pub trait PilotService: Send + Sync {
    async fn create_pilot(&self, description: &PilotDescription) -> Result<Arc<dyn Pilot>>;
}

#[async_trait]
pub trait Pilot: Send + Sync {
    fn id(&self) -> String;

    /// Estado en el vocabulario del servicio (se traduce afuera).
    async fn state(&self) -> Result<String>;

    async fn submit_unit(&self, description: &UnitDescription) -> Result<Arc<dyn ComputeUnit>>;

    async fn cancel(&self) -> Result<()>;
}

#[async_trait]
pub trait ComputeUnit: Send + Sync {
    fn id(&self) -> String;

    async fn state(&self) -> Result<String>;
}

/// Qué backend de pilots usa una asignación.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Pilots en este mismo proceso; las unidades son procesos locales.
    #[default]
    Local,
    /// Pilots alojados en un `agent` remoto vía HTTP.
    Agent,
}

impl BackendKind {
    pub fn build(self) -> Result<Arc<dyn PilotBackend>> {
        Ok(match self {
            BackendKind::Local => Arc::new(LocalBackend::new()),
            BackendKind::Agent => Arc::new(AgentBackend::new()?),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Agent => f.write_str("agent"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "agent" => Ok(BackendKind::Agent),
            other => bail!("backend desconocido '{}' (opciones: local, agent)", other),
        }
    }
}
