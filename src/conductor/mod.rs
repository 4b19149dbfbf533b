use crate::cloud::CloudProvider;
use crate::config::ConductorConfig;
use crate::error::{ContractError, Result};
use crate::events::{EventBus, EventKind};
use crate::queue::StartQueue;
use crate::registry::NodeRegistry;
use crate::remote::CommandRunner;
use crate::remote::docker::ContainerHost;
use crate::proxy::ProxyRegistrar;
use crate::store::Store;
use crate::types::{Node, NodeHealth, NodeKind, Workload, WorkloadStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod health;
pub mod ingress;
pub mod lifecycle;
pub mod reconcile;
pub mod scaling;

pub use ingress::Command;

/// Everything the ingress and the background loops share. One `Arc<Core>`
/// travels everywhere; none of its fields require async access to read.
pub struct Core {
    pub config: ConductorConfig,
    pub registry: NodeRegistry,
    pub queue: StartQueue,
    pub store: Arc<dyn Store>,
    pub events: EventBus,
    pub proxy: Arc<dyn ProxyRegistrar>,
    pub cloud: Option<Arc<dyn CloudProvider>>,
    pub docker: ContainerHost,
}

impl Core {
    pub fn control_plane_node_id(&self) -> String {
        match &self.config.control_plane_node_id {
            Some(id) => id.clone(),
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "local-node".to_string()),
        }
    }

    fn control_plane_node(&self) -> Node {
        Node {
            node_id: self.control_plane_node_id(),
            kind: NodeKind::ControlPlane,
            addr: self.config.control_plane_ip,
            ssh_user: None,
            total_ram_mb: self.config.control_plane_ram_mb,
            total_cpu: self.config.control_plane_cpu,
            reserved_ram_mb: 0,
            reserved_cpu: 0,
            health: NodeHealth::Healthy,
            last_probe_at: None,
            consecutive_failures: 0,
            hourly_price_milli: 0,
            created_at: Utc::now(),
            origin: None,
            idle_since: None,
        }
    }

    /// Lowest free port in the configured range, skipping every port held by
    /// a non-terminal workload.
    pub async fn allocate_port(&self) -> Result<u16> {
        let [start, end] = self.config.mc_port_range;
        let taken: Vec<u16> = self
            .store
            .list_workloads()
            .await?
            .into_iter()
            .filter(|w| !w.status.is_terminal())
            .map(|w| w.port)
            .collect();
        (start..=end)
            .find(|p| !taken.contains(p))
            .ok_or_else(|| ContractError::PortsExhausted { start, end }.into())
    }

    /// Alert path for invariant violations: log loudly, emit an event,
    /// keep running.
    pub fn alert(&self, detail: &str) {
        error!("🚨 invariant violation: {}", detail);
        self.events.publish(
            EventKind::ConductorAlert,
            serde_json::json!({ "node_id": "conductor", "detail": detail }),
        );
    }
}

/// Escalating log cadence for background-loop failures: debug on the first,
/// warn on the second, error from the fifth consecutive failure on.
pub(crate) struct FailureStreak {
    what: &'static str,
    count: u32,
}

impl FailureStreak {
    pub fn new(what: &'static str) -> Self {
        Self { what, count: 0 }
    }

    pub fn failure(&mut self, err: &dyn std::fmt::Display) {
        self.count += 1;
        match self.count {
            1 => debug!("{} failed: {}", self.what, err),
            2..=4 => warn!("{} failed ({} in a row): {}", self.what, self.count, err),
            _ => error!("{} failing persistently ({} in a row): {}", self.what, self.count, err),
        }
    }

    pub fn success(&mut self) {
        if self.count > 1 {
            info!("{} recovered after {} failures", self.what, self.count);
        }
        self.count = 0;
    }
}

/// The fleet orchestrator. Owns node membership, placement, admission,
/// lifecycle sequencing and proxy registration; all mutations are serialised
/// through a single ingress task.
pub struct Conductor {
    core: Arc<Core>,
    ingress_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Conductor {
    /// Production wiring: SQLite store, HTTP proxy registrar, HTTP cloud
    /// provider (when a token is configured), SSH/local command runner.
    pub async fn start(config: ConductorConfig) -> Result<Self> {
        let store: Arc<dyn Store> =
            Arc::new(crate::store::SqliteStore::open(&config.database_path).await?);
        let proxy: Arc<dyn ProxyRegistrar> =
            Arc::new(crate::proxy::HttpProxyRegistrar::new(&config.proxy_api_url)?);
        let cloud: Option<Arc<dyn CloudProvider>> = match &config.cloud_token {
            Some(token) => Some(Arc::new(crate::cloud::HttpCloudProvider::new(
                &config.cloud_api_url,
                token,
            )?)),
            None => None,
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::remote::NodeRunner::new(
            config.ssh_private_key_path.clone(),
        ));

        Self::with_backends(config, store, proxy, cloud, runner).await
    }

    /// Assemble with injected backends. Tests use this with an in-memory
    /// store and fake runners/registrars.
    pub async fn with_backends(
        config: ConductorConfig,
        store: Arc<dyn Store>,
        proxy: Arc<dyn ProxyRegistrar>,
        cloud: Option<Arc<dyn CloudProvider>>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let core = Arc::new(Core {
            registry: NodeRegistry::new(),
            queue: StartQueue::new(),
            docker: ContainerHost::new(runner),
            events: EventBus::new(),
            store,
            proxy,
            cloud,
            config,
        });

        info!("🚀 Conductor starting up");
        core.registry.add_node(core.control_plane_node());

        // Mandatory startup sync: adopt containers, rebuild the queue,
        // restore cloud nodes, re-register with the proxy. Loops must not
        // run before this completes.
        reconcile::run(&core).await?;

        let (ingress_tx, ingress_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(crate::events::spawn_persistence_sink(
            &core.events,
            core.store.clone(),
            shutdown_rx.clone(),
        ));
        tasks.push(tokio::spawn(ingress::run_ingress(
            core.clone(),
            ingress_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(health::run_health_loop(
            core.clone(),
            ingress_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(scaling::run_scaling_loop(
            core.clone(),
            ingress_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_proxy_monitor(
            core.clone(),
            ingress_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_queue_pump(
            core.clone(),
            ingress_tx.clone(),
            shutdown_rx,
        )));

        Ok(Self {
            core,
            ingress_tx,
            shutdown_tx,
            tasks,
        })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ingress_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("conductor is shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("conductor dropped the request"))?
    }

    /// Admit a new workload: allocate a port, persist it as queued and kick
    /// the queue pump.
    pub async fn create_workload(&self, ram_mb: u64, cpu_share: u32) -> Result<Workload> {
        self.send(|reply| Command::CreateWorkload {
            ram_mb,
            cpu_share,
            reply,
        })
        .await
    }

    pub async fn stop_workload(&self, id: Uuid) -> Result<()> {
        self.send(|reply| Command::StopWorkload { id, reply }).await
    }

    pub async fn delete_workload(&self, id: Uuid) -> Result<()> {
        self.send(|reply| Command::DeleteWorkload { id, reply }).await
    }

    /// Re-admit an errored workload.
    pub async fn retry_workload(&self, id: Uuid) -> Result<()> {
        self.send(|reply| Command::RetryWorkload { id, reply }).await
    }

    pub async fn list_workloads(&self) -> Result<Vec<Workload>> {
        self.core.store.list_workloads().await
    }

    pub async fn get_workload(&self, id: Uuid) -> Result<Workload> {
        self.core
            .store
            .get_workload(id)
            .await?
            .ok_or_else(|| {
                ContractError::WorkloadNotFound {
                    workload_id: id.to_string(),
                }
                .into()
            })
    }

    /// Register an externally managed worker. Dedicated machines join
    /// unknown; the health loop promotes them once they answer a probe.
    pub async fn add_dedicated_node(
        &self,
        node_id: &str,
        addr: std::net::Ipv4Addr,
        ssh_user: &str,
        total_ram_mb: u64,
        total_cpu: u32,
    ) -> Result<()> {
        let node = Node {
            node_id: node_id.to_string(),
            kind: NodeKind::Dedicated,
            addr,
            ssh_user: Some(ssh_user.to_string()),
            total_ram_mb,
            total_cpu,
            reserved_ram_mb: 0,
            reserved_cpu: 0,
            health: NodeHealth::Unknown,
            last_probe_at: None,
            consecutive_failures: 0,
            hourly_price_milli: 0,
            created_at: Utc::now(),
            origin: None,
            idle_since: None,
        };
        self.send(|reply| Command::AddNode { node, reply }).await
    }

    /// Remove a node that no longer holds any placement. Drain it first if
    /// workloads are still placed on it.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        let node_id = node_id.to_string();
        self.send(|reply| Command::RemoveNode { node_id, reply })
            .await
    }

    /// Mark a node as draining so no new workloads land on it.
    pub async fn drain_node(&self, node_id: &str) -> Result<()> {
        self.ingress_tx
            .send(Command::DrainNode {
                node_id: node_id.to_string(),
                reason: "operator request".to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("conductor is shut down").into())
    }

    /// Current player count for a running workload, as the proxy sees it.
    pub async fn workload_players(&self, id: Uuid) -> Result<Option<u32>> {
        self.core
            .proxy
            .player_count(&crate::types::workload_name(&id))
            .await
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.core.registry.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.core.queue.depth()
    }

    pub fn subscribe_events(&self, name: &str) -> mpsc::Receiver<crate::events::Event> {
        self.core.events.subscribe(name, 64)
    }

    /// Nudge the queue pump (tests use this instead of waiting for a tick).
    pub async fn pump_queue(&self) -> Result<()> {
        self.ingress_tx
            .send(Command::StartNext)
            .await
            .map_err(|_| anyhow::anyhow!("conductor is shut down").into())
    }

    /// Graceful shutdown: stop the loops, drain the ingress, leave workloads
    /// running on their hosts for re-adoption at next startup.
    pub async fn shutdown(mut self) {
        info!("🛑 Conductor shutting down");
        let _ = self.shutdown_tx.send(true);
        let _ = self.ingress_tx.send(Command::Shutdown).await;

        let grace = self.core.config.shutdown_grace();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background task did not drain within {:?}", grace);
            }
        }
        info!("Conductor stopped; workloads keep running for re-adoption");
    }
}

/// Queue pump: while anything is queued, ask the ingress to try placements.
async fn run_queue_pump(
    core: Arc<Core>,
    ingress_tx: mpsc::Sender<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if core.queue.depth() > 0 && ingress_tx.send(Command::StartNext).await.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Proxy-sync loop: probe the proxy every `proxy_health_interval`; on
/// recovery (or drift between the proxy's route table and the running set)
/// ask the ingress for a full resync.
async fn run_proxy_monitor(
    core: Arc<Core>,
    ingress_tx: mpsc::Sender<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(core.config.proxy_health_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut streak = FailureStreak::new("proxy health probe");
    let mut was_healthy = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match core.proxy.health().await {
                    Ok(health) => {
                        streak.success();
                        let recovered = !was_healthy;
                        was_healthy = true;
                        if recovered {
                            info!(
                                "💚 proxy back ({} v{}), resyncing routes",
                                health.status, health.version
                            );
                        }
                        let needs_sync = recovered || proxy_routes_drifted(&core).await;
                        if needs_sync && ingress_tx.send(Command::ResyncProxy).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        streak.failure(&err);
                        was_healthy = false;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Compare the proxy's route table against the running set. Read-only, so
/// it may run outside the ingress; the resync itself goes through it.
async fn proxy_routes_drifted(core: &Arc<Core>) -> bool {
    use crate::registry::RemoteNodeLookup;
    use std::collections::HashMap;

    let running = match core.store.list_by_status(WorkloadStatus::Running).await {
        Ok(running) => running,
        Err(err) => {
            debug!("route drift check skipped: {}", err);
            return false;
        }
    };
    let routes = match core.proxy.list().await {
        Ok(servers) => servers,
        Err(err) => {
            debug!("route drift check skipped: {}", err);
            return false;
        }
    };

    let mut desired: HashMap<String, String> = HashMap::new();
    for workload in &running {
        let Some(ip) = workload
            .node_id
            .as_deref()
            .and_then(|id| core.registry.node_ip(id))
        else {
            continue;
        };
        desired.insert(workload.name(), format!("{}:{}", ip, workload.port));
    }

    let platform_routes: HashMap<String, String> = routes
        .into_iter()
        .filter(|s| s.name.starts_with(crate::types::WORKLOAD_PREFIX))
        .map(|s| (s.name, s.address))
        .collect();
    platform_routes != desired
}
