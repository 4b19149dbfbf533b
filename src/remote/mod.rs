use crate::error::{Result, TransportError};
use crate::types::Node;
use async_trait::async_trait;
use ssh2::Session;
use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub mod docker;

/// Combined output of one shell command on a node.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs a single shell command on a node. The control plane executes
/// locally; every other node kind goes over SSH.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, node: &Node, command: &str) -> Result<CommandOutput>;
}

/// Executes on the control-plane host itself via the local shell.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, _node: &Node, command: &str) -> Result<CommandOutput> {
        debug!("local exec: {}", command);
        let result = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        Ok(CommandOutput {
            output,
            exit_code: result.status.code().unwrap_or(-1),
        })
    }
}

/// Executes over SSH, one connection per call, public-key auth.
///
/// The private key path is captured once at startup; host-key verification is
/// left to deployment (TOFU pinning in known_hosts).
pub struct SshRunner {
    key_path: PathBuf,
    timeout: Duration,
}

impl SshRunner {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(key_path: PathBuf, timeout: Duration) -> Self {
        Self { key_path, timeout }
    }

    fn exec_blocking(
        addr: std::net::SocketAddr,
        user: String,
        key_path: PathBuf,
        timeout: Duration,
        command: String,
    ) -> std::result::Result<CommandOutput, String> {
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| e.to_string())?;
        tcp.set_read_timeout(Some(timeout)).map_err(|e| e.to_string())?;
        tcp.set_write_timeout(Some(timeout)).map_err(|e| e.to_string())?;

        let mut session = Session::new().map_err(|e| e.to_string())?;
        session.set_timeout(timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| e.to_string())?;
        session
            .userauth_pubkey_file(&user, None, &key_path, None)
            .map_err(|e| e.to_string())?;

        let mut channel = session.channel_session().map_err(|e| e.to_string())?;
        channel.exec(&command).map_err(|e| e.to_string())?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| e.to_string())?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| e.to_string())?;
        output.push_str(&stderr);

        channel.wait_close().ok();
        let exit_code = channel.exit_status().map_err(|e| e.to_string())?;

        Ok(CommandOutput { output, exit_code })
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, node: &Node, command: &str) -> Result<CommandOutput> {
        let addr = std::net::SocketAddr::from((node.addr, 22));
        let user = node.ssh_user.clone().unwrap_or_else(|| "root".to_string());
        let key_path = self.key_path.clone();
        let timeout = self.timeout;
        let command = command.to_string();
        debug!("ssh exec on {}: {}", node.node_id, command);

        let handle = tokio::task::spawn_blocking(move || {
            Self::exec_blocking(addr, user, key_path, timeout, command)
        });

        // spawn_blocking cannot be cancelled; the outer deadline covers the
        // pathological case of a TCP stack that ignores its socket timeouts.
        let joined = tokio::time::timeout(self.timeout * 2, handle).await;
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(join_err.to_string()),
            Err(_) => {
                warn!("ssh to {} exceeded hard deadline", node.node_id);
                Err("hard deadline exceeded".to_string())
            }
        };

        result.map_err(|reason| {
            TransportError::SshUnreachable {
                addr: addr.to_string(),
                reason,
            }
            .into()
        })
    }
}

/// Pick the right runner for a node kind.
pub struct NodeRunner {
    local: LocalRunner,
    ssh: SshRunner,
}

impl NodeRunner {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            local: LocalRunner,
            ssh: SshRunner::new(key_path),
        }
    }
}

#[async_trait]
impl CommandRunner for NodeRunner {
    async fn run(&self, node: &Node, command: &str) -> Result<CommandOutput> {
        match node.kind {
            crate::types::NodeKind::ControlPlane => self.local.run(node, command).await,
            _ => self.ssh.run(node, command).await,
        }
    }
}
