use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

use super::wire::{CancelResponse, CreatePilotResponse, PilotStatus, SubmitUnitResponse, UnitStatus};
use super::{ComputeUnit, Pilot, PilotBackend, PilotDescription, PilotService, UnitDescription};

/// Tope de cada pedido HTTP al agent.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend que habla con un `agent` por HTTP.
#[derive(Debug, Clone)]
pub struct AgentBackend {
    client: Client,
}

impl AgentBackend {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("no se pudo crear el cliente HTTP")?;
        Ok(Self { client })
    }
}

/// Conexión a un agent. La credencial, si viene en la URL del broker,
/// se manda como basic auth.
#[derive(Clone)]
struct AgentConn {
    client: Client,
    base: String,
    credential: Option<String>,
}

impl AgentConn {
    fn from_broker(client: Client, broker: &Url) -> Self {
        let mut clean = broker.clone();
        let credential = broker.password().map(str::to_string);
        let _ = clean.set_password(None);
        let _ = clean.set_username("");
        let base = clean.as_str().trim_end_matches('/').to_string();
        Self {
            client,
            base,
            credential,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(pwd) => req.basic_auth("", Some(pwd)),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("error HTTP en GET {}", url))?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let url = self.url(path);
        let resp = self
            .auth(self.client.post(&url).json(body))
            .send()
            .await
            .with_context(|| format!("error HTTP en POST {}", url))?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl PilotBackend for AgentBackend {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn connect(&self, broker: &Url) -> Result<Arc<dyn PilotService>> {
        let conn = AgentConn::from_broker(self.client.clone(), broker);

        // fallar rápido si el agent no responde
        let health = conn.url("/health");
        conn.auth(conn.client.get(&health))
            .send()
            .await
            .with_context(|| format!("no se pudo contactar al agent en {}", conn.base))?
            .error_for_status()?;

        info!("conectado al agent {}", conn.base);
        Ok(Arc::new(AgentService { conn }))
    }
}

struct AgentService {
    conn: AgentConn,
}

#[async_trait]
impl PilotService for AgentService {
    async fn create_pilot(&self, description: &PilotDescription) -> Result<Arc<dyn Pilot>> {
        let resp: CreatePilotResponse = self.conn.post_json("/api/v1/pilots", description).await?;
        debug!("agent creó el pilot {}", resp.pilot_id);
        Ok(Arc::new(AgentPilot {
            conn: self.conn.clone(),
            id: resp.pilot_id,
        }))
    }
}

struct AgentPilot {
    conn: AgentConn,
    id: String,
}

#[async_trait]
impl Pilot for AgentPilot {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        let status: PilotStatus = self
            .conn
            .get_json(&format!("/api/v1/pilots/{}", self.id))
            .await?;
        Ok(status.state)
    }

    async fn submit_unit(&self, description: &UnitDescription) -> Result<Arc<dyn ComputeUnit>> {
        let resp: SubmitUnitResponse = self
            .conn
            .post_json(&format!("/api/v1/pilots/{}/units", self.id), description)
            .await?;
        Ok(Arc::new(AgentUnit {
            conn: self.conn.clone(),
            id: resp.unit_id,
        }))
    }

    async fn cancel(&self) -> Result<()> {
        let _: CancelResponse = self
            .conn
            .post_json(&format!("/api/v1/pilots/{}/cancel", self.id), &())
            .await?;
        Ok(())
    }
}

struct AgentUnit {
    conn: AgentConn,
    id: String,
}

#[async_trait]
impl ComputeUnit for AgentUnit {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn state(&self) -> Result<String> {
        let status: UnitStatus = self
            .conn
            .get_json(&format!("/api/v1/units/{}", self.id))
            .await?;
        Ok(status.state)
    }
}
