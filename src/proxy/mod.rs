use crate::error::{Result, TransportError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// A backend the proxy currently routes to.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyServer {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub players: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyHealth {
    pub status: String,
    pub version: String,
    pub servers_count: u32,
    pub players_online: u32,
}

/// Registers and unregisters backend endpoints with the front-end proxy.
#[async_trait]
pub trait ProxyRegistrar: Send + Sync {
    async fn register(&self, name: &str, address: &str) -> Result<()>;
    async fn unregister(&self, name: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<ProxyServer>>;
    async fn player_count(&self, name: &str) -> Result<Option<u32>>;
    async fn health(&self) -> Result<ProxyHealth>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    count: u32,
    servers: Vec<ProxyServer>,
}

#[derive(Debug, Deserialize)]
struct PlayersResponse {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    server: String,
    players: u32,
}

/// JSON-over-HTTP client against the proxy management API.
pub struct HttpProxyRegistrar {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProxyRegistrar {
    pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Self::CLIENT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("proxy client build failed: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn transport_err(&self, url: &str, err: reqwest::Error) -> crate::error::ConductorError {
        if err.is_timeout() {
            TransportError::HttpTimeout {
                url: url.to_string(),
            }
            .into()
        } else {
            TransportError::HttpFailed {
                url: url.to_string(),
                reason: err.to_string(),
            }
            .into()
        }
    }
}

#[async_trait]
impl ProxyRegistrar for HttpProxyRegistrar {
    async fn register(&self, name: &str, address: &str) -> Result<()> {
        let url = format!("{}/api/servers", self.base_url);
        let body = serde_json::json!({ "name": name, "address": address });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("register returned {}", response.status()),
            }
            .into());
        }
        info!("🔗 proxy route {} -> {}", name, address);
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/servers/{}", self.base_url, name);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        // 404 means the route is already gone, which is what we wanted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("proxy route {} was already unregistered", name);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("unregister returned {}", response.status()),
            }
            .into());
        }
        info!("⛓️  proxy route {} removed", name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProxyServer>> {
        let url = format!("{}/api/servers", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("list returned {}", response.status()),
            }
            .into());
        }
        let listed: ListResponse = response
            .json()
            .await
            .map_err(|e| self.transport_err(&url, e))?;
        Ok(listed.servers)
    }

    async fn player_count(&self, name: &str) -> Result<Option<u32>> {
        let url = format!("{}/api/players/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("players returned {}", response.status()),
            }
            .into());
        }
        let players: PlayersResponse = response
            .json()
            .await
            .map_err(|e| self.transport_err(&url, e))?;
        Ok(Some(players.players))
    }

    async fn health(&self) -> Result<ProxyHealth> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("health returned {}", response.status()),
            }
            .into());
        }
        response.json().await.map_err(|e| self.transport_err(&url, e))
    }
}
