use thiserror::Error;

/// Conductor-specific error types for better error handling
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Recoverable: the caller may retry another node or enqueue the workload.
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("no node can satisfy {ram_mb} MB / {cpu_share} CPU")]
    NoCapacity { ram_mb: u64, cpu_share: u32 },

    #[error("node {node_id} cannot fit {ram_mb} MB / {cpu_share} CPU")]
    InsufficientCapacity {
        node_id: String,
        ram_mb: u64,
        cpu_share: u32,
    },

    #[error("node {node_id} is not accepting workloads ({health})")]
    NodeUnhealthy { node_id: String, health: String },
}

/// Recovered locally by retrying at the next tick; surfaced only when persistent.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("SSH to {addr} failed: {reason}")]
    SshUnreachable { addr: String, reason: String },

    #[error("HTTP request to {url} timed out")]
    HttpTimeout { url: String },

    #[error("HTTP request to {url} failed: {reason}")]
    HttpFailed { url: String, reason: String },

    #[error("command on {node_id} exited with status {exit_code}: {output}")]
    CommandFailed {
        node_id: String,
        exit_code: i32,
        output: String,
    },
}

/// Fatal for the caller: logged and returned.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("workload not found: {workload_id}")]
    WorkloadNotFound { workload_id: String },

    #[error("workload {workload_id} cannot go {from} -> {to}")]
    InvalidTransition {
        workload_id: String,
        from: String,
        to: String,
    },

    #[error("node {node_id} still has {remaining} placed workload(s)")]
    NodeBusy { node_id: String, remaining: usize },

    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row for workload {workload_id}: {reason}")]
    CorruptRow { workload_id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at path: {path}")]
    FileNotFound { path: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },
}

impl ConductorError {
    /// Capacity errors are the only class a caller reacts to by enqueueing
    /// and signalling the scaler.
    pub fn is_capacity(&self) -> bool {
        matches!(self, ConductorError::Capacity(_))
    }
}

/// Convenience type alias for Conductor results
pub type Result<T, E = ConductorError> = std::result::Result<T, E>;
