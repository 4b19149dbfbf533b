use crate::error::{Result, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};

/// Name prefix for VMs the Conductor provisions; `list_nodes` filters on it
/// so manually created servers in the same project are never adopted.
pub const FLEET_NODE_PREFIX: &str = "mc-worker-";

/// A rentable VM shape with its hourly price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceClass {
    pub name: String,
    pub ram_mb: u64,
    pub cpu: u32,
    /// Thousandths of the billing currency per hour
    pub hourly_price_milli: u64,
}

/// The catalog the scaling loop picks from, cheapest first.
pub fn instance_catalog() -> Vec<InstanceClass> {
    vec![
        InstanceClass {
            name: "w-small".to_string(),
            ram_mb: 4096,
            cpu: 2,
            hourly_price_milli: 7,
        },
        InstanceClass {
            name: "w-medium".to_string(),
            ram_mb: 8192,
            cpu: 4,
            hourly_price_milli: 14,
        },
        InstanceClass {
            name: "w-large".to_string(),
            ram_mb: 16384,
            cpu: 8,
            hourly_price_milli: 28,
        },
        InstanceClass {
            name: "w-xlarge".to_string(),
            ram_mb: 32768,
            cpu: 16,
            hourly_price_milli: 55,
        },
    ]
}

/// Cheapest class with at least `ram_mb` of RAM.
pub fn cheapest_class_for(ram_mb: u64) -> Option<InstanceClass> {
    instance_catalog()
        .into_iter()
        .filter(|c| c.ram_mb >= ram_mb)
        .min_by_key(|c| c.hourly_price_milli)
}

pub fn class_by_name(name: &str) -> Option<InstanceClass> {
    instance_catalog().into_iter().find(|c| c.name == name)
}

/// A provisioned VM as the provider reports it.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub origin_id: String,
    pub name: String,
    pub ip: Ipv4Addr,
    pub class: String,
}

/// Create, list and destroy cloud VMs. Create is eventually consistent:
/// the VM may take up to two minutes to accept SSH; the health loop absorbs
/// that latency.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_node(&self, class: &InstanceClass, ssh_key_id: &str) -> Result<NodeHandle>;
    async fn list_nodes(&self) -> Result<Vec<NodeHandle>>;
    async fn destroy(&self, origin_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ApiServer {
    id: u64,
    name: String,
    public_net: ApiPublicNet,
    server_type: ApiServerType,
}

#[derive(Debug, Deserialize)]
struct ApiPublicNet {
    ipv4: ApiIpv4,
}

#[derive(Debug, Deserialize)]
struct ApiIpv4 {
    ip: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
struct ApiServerType {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: ApiServer,
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ApiServer>,
}

/// JSON-over-HTTP provider client with bearer-token auth.
pub struct HttpCloudProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    image: String,
}

impl HttpCloudProvider {
    pub const DEFAULT_VM_IMAGE: &'static str = "docker-ce";

    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("cloud client build failed: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            image: Self::DEFAULT_VM_IMAGE.to_string(),
        })
    }

    fn handle(server: ApiServer) -> NodeHandle {
        NodeHandle {
            origin_id: server.id.to_string(),
            name: server.name,
            ip: server.public_net.ipv4.ip,
            class: server.server_type.name,
        }
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
impl CloudProvider for HttpCloudProvider {
    async fn create_node(&self, class: &InstanceClass, ssh_key_id: &str) -> Result<NodeHandle> {
        let name = format!("{}{}", FLEET_NODE_PREFIX, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let url = format!("{}/servers", self.base_url);
        let body = serde_json::json!({
            "name": name,
            "server_type": class.name,
            "image": self.image,
            "ssh_keys": [ssh_key_id],
            "start_after_create": true,
        });

        info!("☁️  provisioning {} ({})", name, class.name);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("create returned {}", response.status()),
            }
            .into());
        }

        let created: CreateServerResponse = response
            .json()
            .await
            .map_err(|e| self.transport_err(&url, e))?;
        Ok(Self::handle(created.server))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeHandle>> {
        let url = format!("{}/servers", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
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

        let listed: ListServersResponse = response
            .json()
            .await
            .map_err(|e| self.transport_err(&url, e))?;
        Ok(listed
            .servers
            .into_iter()
            .filter(|s| s.name.starts_with(FLEET_NODE_PREFIX))
            .map(Self::handle)
            .collect())
    }

    async fn destroy(&self, origin_id: &str) -> Result<()> {
        let url = format!("{}/servers/{}", self.base_url, origin_id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_err(&url, e))?;

        // A server that is already gone is a success for our purposes.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("cloud server {} was already destroyed", origin_id);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(TransportError::HttpFailed {
                url,
                reason: format!("destroy returned {}", response.status()),
            }
            .into());
        }
        info!("🔥 destroyed cloud server {}", origin_id);
        Ok(())
    }
}
