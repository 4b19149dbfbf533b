use crate::error::{Result, TransportError};
use crate::types::{Node, Workload, WORKLOAD_PREFIX, parse_workload_name};
use crate::remote::CommandRunner;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Container port the game server listens on inside the image.
const CONTAINER_GAME_PORT: u16 = 25565;

/// A running workload container as reported by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadContainer {
    pub container_id: String,
    pub name: String,
    pub workload_id: Uuid,
}

/// Host memory and CPU as reported by `docker info`.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub mem_total_mb: u64,
    pub cpu_count: u32,
}

/// The docker command surface the Conductor drives on every node.
///
/// Output parsing is line-oriented; deletes treat "No such container" as
/// success so retries stay idempotent.
pub struct ContainerHost {
    runner: Arc<dyn CommandRunner>,
}

impl ContainerHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// `docker run` a workload container. Returns the container id.
    pub async fn run_workload(&self, node: &Node, workload: &Workload, image: &str) -> Result<String> {
        let name = workload.name();
        let memory_bytes = workload.ram_mb * 1024 * 1024;
        let command = format!(
            "docker run -d --name {name} \
             -e EULA=TRUE -e MEMORY={ram}M \
             -p {port}:{container_port} \
             -v {name}-data:/data \
             --memory={memory_bytes} --cpus={cpus} --restart=no {image}",
            name = name,
            ram = workload.ram_mb,
            port = workload.port,
            container_port = CONTAINER_GAME_PORT,
            memory_bytes = memory_bytes,
            cpus = workload.cpu_share,
            image = image,
        );

        let result = self.runner.run(node, &command).await?;
        if !result.is_success() {
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }

        let container_id = result
            .lines()
            .last()
            .unwrap_or_default()
            .to_string();
        info!("🐳 started container {} ({})", name, short_id(&container_id));
        Ok(container_id)
    }

    pub async fn stop_container(&self, node: &Node, name: &str, grace_secs: u32) -> Result<()> {
        let command = format!("docker stop --time {grace_secs} {name}");
        let result = self.runner.run(node, &command).await?;
        if !result.is_success() && !is_missing_container(&result.output) {
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Remove a container. A container that is already gone counts as removed.
    pub async fn remove_container(&self, node: &Node, name: &str, force: bool) -> Result<()> {
        let command = if force {
            format!("docker rm --force {name}")
        } else {
            format!("docker rm {name}")
        };
        let result = self.runner.run(node, &command).await?;
        if !result.is_success() && !is_missing_container(&result.output) {
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }
        debug!("removed container {} on {}", name, node.node_id);
        Ok(())
    }

    /// List running workload containers on a node.
    pub async fn list_workload_containers(&self, node: &Node) -> Result<Vec<WorkloadContainer>> {
        let command = format!(
            "docker ps --filter name={WORKLOAD_PREFIX} --format {{{{.ID}}}}|{{{{.Names}}}}"
        );
        let result = self.runner.run(node, &command).await?;
        if !result.is_success() {
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }
        Ok(parse_container_list(&result.output))
    }

    /// `docker inspect` the container's state. `None` when it does not exist.
    pub async fn inspect_status(&self, node: &Node, name: &str) -> Result<Option<String>> {
        let command = format!("docker inspect --format {{{{.State.Status}}}} {name}");
        let result = self.runner.run(node, &command).await?;
        if !result.is_success() {
            if is_missing_container(&result.output) {
                return Ok(None);
            }
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }
        Ok(result.lines().next().map(str::to_string))
    }

    pub async fn tail_logs(&self, node: &Node, name: &str, lines: u32) -> Result<String> {
        let command = format!("docker logs --tail {lines} {name}");
        let result = self.runner.run(node, &command).await?;
        Ok(result.output)
    }

    /// Lightweight liveness probe; doubles as the capacity report.
    pub async fn host_resources(&self, node: &Node) -> Result<HostResources> {
        let command = "docker info --format '{{.MemTotal}} {{.NCPU}}'";
        let result = self.runner.run(node, command).await?;
        if !result.is_success() {
            return Err(TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            }
            .into());
        }
        parse_host_resources(&result.output).ok_or_else(|| {
            TransportError::CommandFailed {
                node_id: node.node_id.clone(),
                exit_code: 0,
                output: format!("unparseable docker info output: {}", result.output.trim()),
            }
            .into()
        })
    }

    /// Health-loop probe: true when the docker daemon answers.
    pub async fn probe(&self, node: &Node) -> bool {
        self.host_resources(node).await.is_ok()
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn is_missing_container(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("not found")
}

fn parse_container_list(output: &str) -> Vec<WorkloadContainer> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let (id, name) = line.split_once('|')?;
            let workload_id = parse_workload_name(name)?;
            Some(WorkloadContainer {
                container_id: id.to_string(),
                name: name.to_string(),
                workload_id,
            })
        })
        .collect()
}

fn parse_host_resources(output: &str) -> Option<HostResources> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches('\'');
    let mut parts = line.split_whitespace();
    let mem_total: u64 = parts.next()?.parse().ok()?;
    let cpu_count: u32 = parts.next()?.parse().ok()?;
    Some(HostResources {
        mem_total_mb: mem_total / (1024 * 1024),
        cpu_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_list_parsing_skips_foreign_names() {
        let id = Uuid::new_v4();
        let output = format!(
            "abc123def456|mc-{id}\n\
             999888777666|postgres\n\
             \n\
             111222333444|mc-garbage\n"
        );
        let parsed = parse_container_list(&output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].container_id, "abc123def456");
        assert_eq!(parsed[0].workload_id, id);
    }

    #[test]
    fn host_resources_parse_docker_info_line() {
        let parsed = parse_host_resources("'16777216000 8'\n").unwrap();
        assert_eq!(parsed.mem_total_mb, 16000);
        assert_eq!(parsed.cpu_count, 8);

        assert!(parse_host_resources("garbage").is_none());
        assert!(parse_host_resources("").is_none());
    }

    #[test]
    fn missing_container_output_is_recognised() {
        assert!(is_missing_container(
            "Error response from daemon: No such container: mc-x"
        ));
        assert!(is_missing_container("Error: container not found"));
        assert!(!is_missing_container("permission denied"));
    }
}
