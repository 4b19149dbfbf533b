//! Shared fakes: an in-process docker host behind `CommandRunner`, a
//! recording proxy registrar and a scripted cloud provider.

#![allow(dead_code)]

use async_trait::async_trait;
use conductor::api::*;
use conductor::error::TransportError;
use conductor::types::NodeHealth;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One fake docker host.
#[derive(Default)]
pub struct HostState {
    pub reachable: bool,
    pub mem_total_mb: u64,
    pub ncpu: u32,
    /// container name -> container id
    pub containers: HashMap<String, String>,
    /// next `docker run` fails this many times
    pub failing_starts: u32,
}

/// CommandRunner fake that emulates the docker command surface on a set of
/// named hosts.
pub struct FakeRunner {
    hosts: Mutex<HashMap<String, HostState>>,
    counter: AtomicU32,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
        })
    }

    pub fn add_host(&self, node_id: &str, mem_total_mb: u64, ncpu: u32) {
        self.hosts.lock().unwrap().insert(
            node_id.to_string(),
            HostState {
                reachable: true,
                mem_total_mb,
                ncpu,
                containers: HashMap::new(),
                failing_starts: 0,
            },
        );
    }

    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(node_id) {
            host.reachable = reachable;
        }
    }

    pub fn fail_next_starts(&self, node_id: &str, count: u32) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(node_id) {
            host.failing_starts = count;
        }
    }

    pub fn plant_container(&self, node_id: &str, name: &str) {
        let id = format!("fake{:08}", self.counter.fetch_add(1, Ordering::Relaxed));
        if let Some(host) = self.hosts.lock().unwrap().get_mut(node_id) {
            host.containers.insert(name.to_string(), id);
        }
    }

    pub fn container_names(&self, node_id: &str) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap()
            .get(node_id)
            .map(|h| h.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ok(output: impl Into<String>) -> CommandOutput {
        CommandOutput {
            output: output.into(),
            exit_code: 0,
        }
    }

    fn fail(output: impl Into<String>) -> CommandOutput {
        CommandOutput {
            output: output.into(),
            exit_code: 1,
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        node: &Node,
        command: &str,
    ) -> conductor::Result<CommandOutput> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(&node.node_id)
            .filter(|h| h.reachable)
            .ok_or_else(|| {
                conductor::ConductorError::from(TransportError::SshUnreachable {
                    addr: node.addr.to_string(),
                    reason: "host unreachable".to_string(),
                })
            })?;

        let tokens: Vec<&str> = command.split_whitespace().collect();
        let output = match (tokens.first(), tokens.get(1)) {
            (Some(&"docker"), Some(&"run")) => {
                let name = tokens
                    .iter()
                    .position(|t| *t == "--name")
                    .and_then(|i| tokens.get(i + 1))
                    .expect("docker run without --name")
                    .to_string();
                if host.failing_starts > 0 {
                    host.failing_starts -= 1;
                    Self::fail("docker: Error response from daemon: OCI runtime create failed")
                } else {
                    let id = format!("fake{:08}", self.counter.fetch_add(1, Ordering::Relaxed));
                    host.containers.insert(name, id.clone());
                    Self::ok(format!("{id}\n"))
                }
            }
            (Some(&"docker"), Some(&"stop")) => {
                let name = tokens.last().unwrap().to_string();
                if host.containers.contains_key(&name) {
                    Self::ok(format!("{name}\n"))
                } else {
                    Self::fail(format!("Error response from daemon: No such container: {name}"))
                }
            }
            (Some(&"docker"), Some(&"rm")) => {
                let name = tokens.last().unwrap().to_string();
                if host.containers.remove(&name).is_some() {
                    Self::ok(format!("{name}\n"))
                } else {
                    Self::fail(format!("Error response from daemon: No such container: {name}"))
                }
            }
            (Some(&"docker"), Some(&"ps")) => {
                let lines: Vec<String> = host
                    .containers
                    .iter()
                    .filter(|(name, _)| name.starts_with("mc-"))
                    .map(|(name, id)| format!("{id}|{name}"))
                    .collect();
                Self::ok(lines.join("\n"))
            }
            (Some(&"docker"), Some(&"inspect")) => {
                let name = tokens.last().unwrap().to_string();
                if host.containers.contains_key(&name) {
                    Self::ok("running\n")
                } else {
                    Self::fail(format!("Error: No such object: {name}"))
                }
            }
            (Some(&"docker"), Some(&"logs")) => Self::ok(""),
            (Some(&"docker"), Some(&"info")) => {
                Self::ok(format!("{} {}\n", host.mem_total_mb * 1024 * 1024, host.ncpu))
            }
            _ => panic!("fake runner got unexpected command: {command}"),
        };
        Ok(output)
    }
}

/// ProxyRegistrar fake that records the route table in memory.
pub struct FakeProxy {
    pub routes: Mutex<HashMap<String, String>>,
    pub healthy: AtomicBool,
}

impl FakeProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        })
    }

    pub fn route(&self, name: &str) -> Option<String> {
        self.routes.lock().unwrap().get(name).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check(&self) -> conductor::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::HttpTimeout {
                url: "http://fake-proxy/health".to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl ProxyRegistrar for FakeProxy {
    async fn register(&self, name: &str, address: &str) -> conductor::Result<()> {
        self.check()?;
        self.routes
            .lock()
            .unwrap()
            .insert(name.to_string(), address.to_string());
        Ok(())
    }

    async fn unregister(&self, name: &str) -> conductor::Result<()> {
        self.check()?;
        self.routes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self) -> conductor::Result<Vec<ProxyServer>> {
        self.check()?;
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, address)| ProxyServer {
                name: name.clone(),
                address: address.clone(),
                players: 0,
            })
            .collect())
    }

    async fn player_count(&self, name: &str) -> conductor::Result<Option<u32>> {
        self.check()?;
        Ok(self.routes.lock().unwrap().get(name).map(|_| 0))
    }

    async fn health(&self) -> conductor::Result<ProxyHealth> {
        self.check()?;
        Ok(ProxyHealth {
            status: "ok".to_string(),
            version: "3.3.0".to_string(),
            servers_count: self.routes.lock().unwrap().len() as u32,
            players_online: 0,
        })
    }
}

/// CloudProvider fake with deterministic server names.
pub struct FakeCloud {
    pub servers: Mutex<Vec<NodeHandle>>,
    pub destroyed: Mutex<Vec<String>>,
    counter: AtomicU32,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            counter: AtomicU32::new(1),
        })
    }

    pub fn seed_server(&self, name: &str, ip: Ipv4Addr, class: &str) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.servers.lock().unwrap().push(NodeHandle {
            origin_id: n.to_string(),
            name: name.to_string(),
            ip,
            class: class.to_string(),
        });
    }

    pub fn created_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    pub fn destroyed_ids(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_node(
        &self,
        class: &InstanceClass,
        _ssh_key_id: &str,
    ) -> conductor::Result<NodeHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = NodeHandle {
            origin_id: n.to_string(),
            name: format!("mc-worker-{n}"),
            ip: Ipv4Addr::new(10, 1, 0, n as u8),
            class: class.name.clone(),
        };
        self.servers.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn list_nodes(&self) -> conductor::Result<Vec<NodeHandle>> {
        let destroyed = self.destroyed.lock().unwrap().clone();
        Ok(self
            .servers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !destroyed.contains(&h.origin_id))
            .cloned()
            .collect())
    }

    async fn destroy(&self, origin_id: &str) -> conductor::Result<()> {
        self.destroyed.lock().unwrap().push(origin_id.to_string());
        Ok(())
    }
}

pub const CONTROL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

/// Config tuned for fast test loops: one-second ticks everywhere.
pub fn test_config() -> ConductorConfig {
    let mut config = conductor::create_example_config();
    config.control_plane_ip = CONTROL_IP;
    config.control_plane_node_id = Some("local-node".to_string());
    config.control_plane_ram_mb = 8192;
    config.control_plane_cpu = 4;
    config.health_interval_secs = 1;
    config.scale_interval_secs = 1;
    config.proxy_health_interval_secs = 1;
    config.idle_cooldown_secs = 1;
    config.unhealthy_evict_probes = 5;
    config.mc_port_range = [25600, 25700];
    config
}

pub struct Harness {
    pub runner: Arc<FakeRunner>,
    pub proxy: Arc<FakeProxy>,
    pub cloud: Arc<FakeCloud>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let runner = FakeRunner::new();
        runner.add_host("local-node", 8192, 4);
        Self {
            runner,
            proxy: FakeProxy::new(),
            cloud: FakeCloud::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub async fn start(&self, config: ConductorConfig) -> conductor::Result<Conductor> {
        let cloud: Arc<dyn CloudProvider> = self.cloud.clone();
        Conductor::with_backends(
            config,
            self.store.clone(),
            self.proxy.clone(),
            Some(cloud),
            self.runner.clone(),
        )
        .await
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until<F>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Convenience: a cloud node record for direct registry insertion.
pub fn cloud_node(node_id: &str, ip: Ipv4Addr, ram_mb: u64, cpu: u32, price: u64) -> Node {
    Node {
        node_id: node_id.to_string(),
        kind: conductor::NodeKind::CloudVm,
        addr: ip,
        ssh_user: Some("root".to_string()),
        total_ram_mb: ram_mb,
        total_cpu: cpu,
        reserved_ram_mb: 0,
        reserved_cpu: 0,
        health: NodeHealth::Healthy,
        last_probe_at: None,
        consecutive_failures: 0,
        hourly_price_milli: price,
        created_at: chrono::Utc::now(),
        origin: None,
        idle_since: Some(chrono::Utc::now()),
    }
}
