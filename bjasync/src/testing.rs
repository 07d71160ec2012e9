//! Dobles de prueba para los colaboradores externos.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use url::Url;

use crate::fs::{DirHandle, RemoteFs};
use crate::pilot::{
    ComputeUnit, Pilot, PilotBackend, PilotDescription, PilotService, UnitDescription,
};

/* --------- Filesystem en memoria --------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    CreateDir(String),
    Open(String),
    Copy { source: String, target: String },
    Link { source: String, target: String },
    Close(String),
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsOp::CreateDir(u) => write!(f, "create_dir {}", u),
            FsOp::Open(u) => write!(f, "open {}", u),
            FsOp::Copy { source, target } => write!(f, "copy {} -> {}", source, target),
            FsOp::Link { source, target } => write!(f, "link {} -> {}", source, target),
            FsOp::Close(u) => write!(f, "close {}", u),
        }
    }
}

#[derive(Default)]
struct FsRecord {
    ops: Vec<FsOp>,
    fail_on: Vec<String>,
}

/// Registra cada operación. Una operación cuyo texto contiene alguno de los
/// patrones de `fail_on` falla (igual queda registrada).
#[derive(Clone, Default)]
pub struct MemoryFs {
    inner: Arc<Mutex<FsRecord>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FsRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_on.push(pattern.to_string());
    }

    pub fn ops(&self) -> Vec<FsOp> {
        self.lock().ops.clone()
    }

    fn record(&self, op: FsOp) -> Result<()> {
        let mut rec = self.lock();
        let text = op.to_string();
        rec.ops.push(op);
        if rec.fail_on.iter().any(|p| text.contains(p.as_str())) {
            bail!("fallo simulado en '{}'", text);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn create_dir(&self, url: &Url, _recursive: bool) -> Result<()> {
        self.record(FsOp::CreateDir(url.to_string()))
    }

    async fn open_dir(&self, url: &Url) -> Result<Box<dyn DirHandle>> {
        self.record(FsOp::Open(url.to_string()))?;
        Ok(Box::new(MemoryDir {
            fs: self.clone(),
            url: url.clone(),
        }))
    }
}

struct MemoryDir {
    fs: MemoryFs,
    url: Url,
}

#[async_trait]
impl DirHandle for MemoryDir {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn copy(&mut self, source: &Url, target: &Url) -> Result<()> {
        self.fs.record(FsOp::Copy {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    async fn link(&mut self, source: &Url, target: &Url) -> Result<()> {
        self.fs.record(FsOp::Link {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.fs.record(FsOp::Close(self.url.to_string()))
    }
}

/* --------- Servicio de pilots guionado --------- */

/// Estado que hace fallar la consulta en vez de devolver un string.
pub const QUERY_ERROR: &str = "<query-error>";

struct Script {
    pilot_states: Vec<String>,
    unit_states: Vec<String>,
    fail_connect: bool,
    fail_create: bool,
    fail_submit: bool,
    fail_cancel: bool,
    pilots: Vec<PilotDescription>,
    submissions: Vec<UnitDescription>,
    cancels: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            pilot_states: vec!["Running".to_string()],
            unit_states: vec!["Running".to_string(), "Done".to_string()],
            fail_connect: false,
            fail_create: false,
            fail_submit: false,
            fail_cancel: false,
            pilots: Vec::new(),
            submissions: Vec::new(),
            cancels: 0,
        }
    }
}

/// Cada consulta consume el siguiente estado del guion; el último se repite.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pilot_states(self, states: &[&str]) -> Self {
        self.lock().pilot_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn unit_states(self, states: &[&str]) -> Self {
        self.lock().unit_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_connect(self) -> Self {
        self.lock().fail_connect = true;
        self
    }

    pub fn failing_create(self) -> Self {
        self.lock().fail_create = true;
        self
    }

    pub fn failing_submit(self) -> Self {
        self.lock().fail_submit = true;
        self
    }

    pub fn failing_cancel(self) -> Self {
        self.lock().fail_cancel = true;
        self
    }

    pub fn pilots(&self) -> Vec<PilotDescription> {
        self.lock().pilots.clone()
    }

    pub fn submissions(&self) -> Vec<UnitDescription> {
        self.lock().submissions.clone()
    }

    pub fn cancels(&self) -> usize {
        self.lock().cancels
    }
}

struct Replay {
    states: Mutex<VecDeque<String>>,
}

impl Replay {
    fn new(states: &[String]) -> Self {
        Self {
            states: Mutex::new(states.iter().cloned().collect()),
        }
    }

    fn next(&self) -> Result<String> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        match state {
            Some(s) if s == QUERY_ERROR => bail!("consulta de estado falló (simulado)"),
            Some(s) => Ok(s),
            None => Ok("Unknown".to_string()),
        }
    }
}

#[async_trait]
impl PilotBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, broker: &Url) -> Result<Arc<dyn PilotService>> {
        if self.lock().fail_connect {
            bail!("broker {} no responde (simulado)", broker);
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl PilotService for ScriptedBackend {
    async fn create_pilot(&self, description: &PilotDescription) -> Result<Arc<dyn Pilot>> {
        let mut script = self.lock();
        if script.fail_create {
            bail!("no se pudo crear el pilot (simulado)");
        }
        script.pilots.push(description.clone());
        let states = Replay::new(&script.pilot_states);
        Ok(Arc::new(ScriptedPilot {
            backend: self.clone(),
            id: format!("pilot-{}", script.pilots.len()),
            states,
        }))
    }
}

struct ScriptedPilot {
    backend: ScriptedBackend,
    id: String,
    states: Replay,
}

#[async_trait]
impl Pilot for ScriptedPilot {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        self.states.next()
    }

    async fn submit_unit(&self, description: &UnitDescription) -> Result<Arc<dyn ComputeUnit>> {
        let mut script = self.backend.lock();
        if script.fail_submit {
            bail!("submit rechazado (simulado)");
        }
        script.submissions.push(description.clone());
        Ok(Arc::new(ScriptedUnit {
            id: format!("unit-{}", script.submissions.len()),
            states: Replay::new(&script.unit_states),
        }))
    }

    // cuenta también los intentos fallidos
    async fn cancel(&self) -> Result<()> {
        let mut script = self.backend.lock();
        script.cancels += 1;
        if script.fail_cancel {
            bail!("cancel rechazado (simulado)");
        }
        Ok(())
    }
}

struct ScriptedUnit {
    id: String,
    states: Replay,
}

#[async_trait]
impl ComputeUnit for ScriptedUnit {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        self.states.next()
    }
}
