use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::PathBuf};
use url::Url;

/// Nombre de la entrada que siempre existe en la tabla.
pub const LOCALHOST: &str = "localhost";

/// Parámetros de conexión de un cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// host[:puerto] del coordinador de pilots
    pub broker_host: String,
    #[serde(default)]
    pub broker_credential: Option<String>,
    pub job_manager_url: String,
    pub job_manager_queue: String,
    pub shared_fs_url: String,
    /// Las asignaciones deben ser múltiplos de esto (ej: 16)
    #[serde(default)]
    pub core_increment: Option<u32>,
    #[serde(default)]
    pub scheduler_variant: Option<String>,
}

impl ResourceDescriptor {
    /// Esta misma máquina: filesystem local y pilots locales.
    pub fn localhost() -> Self {
        Self {
            broker_host: "localhost:8090".to_string(),
            broker_credential: None,
            job_manager_url: "fork://localhost".to_string(),
            job_manager_queue: "default".to_string(),
            shared_fs_url: "file:///".to_string(),
            core_increment: None,
            scheduler_variant: None,
        }
    }

    /// URL del broker, con la credencial como password si existe.
    pub fn broker_url(&self) -> Result<Url> {
        let raw = if self.broker_host.contains("://") {
            self.broker_host.clone()
        } else {
            format!("http://{}", self.broker_host)
        };
        let mut url = Url::parse(&raw)
            .with_context(|| format!("broker_host inválido: {}", self.broker_host))?;
        if let Some(cred) = &self.broker_credential {
            url.set_password(Some(cred))
                .map_err(|_| anyhow!("el broker {} no admite credencial", raw))?;
        }
        Ok(url)
    }

    fn expand(mut self) -> Self {
        self.broker_host = expand_env_vars(&self.broker_host);
        self.broker_credential = self.broker_credential.map(|c| expand_env_vars(&c));
        self.job_manager_url = expand_env_vars(&self.job_manager_url);
        self.job_manager_queue = expand_env_vars(&self.job_manager_queue);
        self.shared_fs_url = expand_env_vars(&self.shared_fs_url);
        self
    }
}

/// Tabla estática de recursos, indexada por nombre lógico.
/// Se carga una vez al arrancar y no cambia después.
#[derive(Debug, Clone)]
pub struct ResourceTable {
    resources: BTreeMap<String, ResourceDescriptor>,
}

impl Default for ResourceTable {
    fn default() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(LOCALHOST.to_string(), ResourceDescriptor::localhost());
        Self { resources }
    }
}

impl ResourceTable {
    /// Parsea un JSON `{ "NOMBRE": { ...descriptor } }`.
    /// Las entradas del archivo pisan a las incorporadas.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, ResourceDescriptor> =
            serde_json::from_str(raw).context("tabla de recursos inválida")?;
        let mut table = Self::default();
        for (name, desc) in parsed {
            table.resources.insert(name, desc.expand());
        }
        Ok(table)
    }

    pub fn load(path: &PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("no se pudo leer {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Busca el archivo de recursos; si no hay, queda sólo `localhost`.
    pub fn load_default() -> Result<Self> {
        match resolve_resources_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ResourceDescriptor> {
        self.resources.get(name).ok_or_else(|| {
            anyhow!(
                "recurso desconocido '{}' (disponibles: {})",
                name,
                self.names().join(", ")
            )
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceDescriptor)> {
        self.resources.iter()
    }
}

/// Orden: BJASYNC_RESOURCES, $XDG_CONFIG_HOME/bjasync/resources.json, ./resources.json
pub fn resolve_resources_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("BJASYNC_RESOURCES") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("bjasync").join("resources.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("resources.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Reemplaza `${VAR}` por el valor de la variable; si no existe, lo deja igual.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
