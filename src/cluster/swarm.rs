// ABOUTME: Docker Swarm cluster driver using the docker CLI and the Engine API.
// ABOUTME: Builds go through compose, deploys through `docker stack`, status through bollard.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{Task, TaskState};
use bollard::query_parameters::{InspectNetworkOptions, ListServicesOptions, ListTasksOptions};
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::ports::{check_ports, port_is_free, requested_ports};
use super::stack_file::{inject_agent, render_stack_file};
use super::{
    AgentService, ApiSnafu, BuildSpec, ClusterDriver, ClusterError, ComposeSnafu, FileSnafu,
    HealthReport, PortCheck, ServiceReplicaStatus, StackDeploySpec,
};
use crate::cancel::{CancelToken, DeployContext};
use crate::process::{LineSink, run_capture, run_tracked};
use crate::types::StackName;

/// Label swarm puts on every service of a stack.
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// Tunables for [`SwarmDriver`].
#[derive(Debug, Clone)]
pub struct SwarmOptions {
    /// Directory rendered stack files are written to.
    pub stack_dir: PathBuf,
    pub poll_interval: Duration,
    pub port_range: RangeInclusive<u16>,
}

/// Cluster driver for a single-node Docker Swarm.
pub struct SwarmDriver {
    client: Docker,
    options: SwarmOptions,
}

impl SwarmDriver {
    pub fn new(client: Docker, options: SwarmOptions) -> Self {
        Self { client, options }
    }

    /// Connect to the local Docker daemon, honouring `DOCKER_HOST`.
    pub fn connect(options: SwarmOptions) -> Result<Self, ClusterError> {
        let client = Docker::connect_with_local_defaults().context(ApiSnafu)?;
        Ok(Self::new(client, options))
    }

    fn stack_file_path(&self, stack: &StackName) -> PathBuf {
        self.options.stack_dir.join(format!("{}.stack.yml", stack))
    }

    async fn read_file(path: &Path) -> Result<String, ClusterError> {
        tokio::fs::read_to_string(path)
            .await
            .context(FileSnafu { path })
    }

    async fn write_file(path: &Path, contents: &str) -> Result<(), ClusterError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(FileSnafu { path: parent })?;
        }
        tokio::fs::write(path, contents)
            .await
            .context(FileSnafu { path })
    }
}

/// Container of the lowest-slot running task per service id.
fn running_containers(tasks: &[Task]) -> HashMap<String, String> {
    let mut best: HashMap<String, (i64, String)> = HashMap::new();
    for task in tasks {
        let Some(status) = task.status.as_ref() else {
            continue;
        };
        if status.state != Some(TaskState::RUNNING) {
            continue;
        }
        let (Some(service_id), Some(container_id)) = (
            task.service_id.as_ref(),
            status
                .container_status
                .as_ref()
                .and_then(|c| c.container_id.as_ref()),
        ) else {
            continue;
        };
        let slot = task.slot.unwrap_or(i64::MAX);
        match best.get(service_id) {
            Some((current, _)) if *current <= slot => {}
            _ => {
                best.insert(service_id.clone(), (slot, container_id.clone()));
            }
        }
    }
    best.into_iter()
        .map(|(service, (_, container))| (service, container))
        .collect()
}

fn check_output(command: &str, output: crate::process::CommandOutput) -> Result<(), ClusterError> {
    if output.success {
        return Ok(());
    }
    let detail = if output.stderr.trim().is_empty() {
        output.stdout
    } else {
        output.stderr
    };
    Err(ClusterError::CommandFailed {
        command: command.to_string(),
        code: output.code,
        output: detail.trim().to_string(),
    })
}

#[async_trait]
impl ClusterDriver for SwarmDriver {
    async fn ensure_cluster_mode(&self) -> Result<(), ClusterError> {
        match self.client.inspect_swarm().await {
            Ok(_) => {
                tracing::debug!("Host is already a swarm manager");
                return Ok(());
            }
            Err(e) => tracing::info!("Swarm not initialised ({}), running swarm init", e),
        }

        let mut cmd = Command::new("docker");
        cmd.args(["swarm", "init"]);
        let output = run_capture(&mut cmd).await?;
        // Another caller may have initialised it between inspect and init.
        if !output.success && output.stderr.contains("already part of a swarm") {
            return Ok(());
        }
        check_output("docker swarm init", output)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), ClusterError> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(ClusterError::Api { source: e }),
        }

        tracing::info!("Creating overlay network {}", name);
        let request = bollard::models::NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("overlay".to_string()),
            attachable: Some(true),
            ..Default::default()
        };
        match self.client.create_network(request).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(ClusterError::Api { source: e }),
        }
    }

    async fn validate_and_allocate_ports(
        &self,
        stack: &StackName,
        compose_file: &Path,
        env: &BTreeMap<String, String>,
        auto_allocate: bool,
    ) -> Result<PortCheck, ClusterError> {
        let compose = Self::read_file(compose_file).await?;
        let requests = requested_ports(&compose, env).context(ComposeSnafu { path: compose_file })?;
        if requests.is_empty() {
            return Ok(PortCheck {
                valid: true,
                ..Default::default()
            });
        }

        let own: HashSet<u16> = self
            .list_service_status(stack)
            .await?
            .into_iter()
            .flat_map(|s| s.published_ports)
            .collect();

        Ok(check_ports(
            &requests,
            auto_allocate,
            self.options.port_range.clone(),
            |port| own.contains(&port) || port_is_free(port),
        ))
    }

    async fn build_images(
        &self,
        spec: &BuildSpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&spec.compose_file)
            .args(["-p", spec.stack.as_str(), "--progress", "plain", "build"]);
        if spec.no_cache {
            cmd.arg("--no-cache");
        }
        cmd.current_dir(&spec.project_dir).envs(&spec.env);

        run_tracked(cmd, ctx, on_line).await
    }

    async fn generate_stack_file(
        &self,
        stack: &StackName,
        compose_file: &Path,
        network: &str,
    ) -> Result<PathBuf, ClusterError> {
        let compose = Self::read_file(compose_file).await?;
        let rendered =
            render_stack_file(&compose, stack, network).context(ComposeSnafu { path: compose_file })?;

        let path = self.stack_file_path(stack);
        Self::write_file(&path, &rendered).await?;
        tracing::debug!("Wrote stack file {}", path.display());
        Ok(path)
    }

    async fn deploy_stack(
        &self,
        spec: &StackDeploySpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError> {
        let mut cmd = Command::new("docker");
        cmd.args(["stack", "deploy", "-c"])
            .arg(&spec.stack_file)
            .args(["--prune", "--resolve-image", "never", spec.stack.as_str()])
            .current_dir(&spec.project_dir)
            .envs(&spec.env);

        run_tracked(cmd, ctx, on_line).await
    }

    async fn remove_stack(&self, stack: &StackName) -> Result<(), ClusterError> {
        let mut cmd = Command::new("docker");
        cmd.args(["stack", "rm", stack.as_str()]);
        let output = run_capture(&mut cmd).await?;
        check_output(&format!("docker stack rm {}", stack), output)
    }

    async fn list_service_status(
        &self,
        stack: &StackName,
    ) -> Result<Vec<ServiceReplicaStatus>, ClusterError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", STACK_NAMESPACE_LABEL, stack)],
        );
        let options = ListServicesOptions {
            filters: Some(filters),
            status: Some(true),
        };

        let services = self
            .client
            .list_services(Some(options))
            .await
            .context(ApiSnafu)?;

        let mut task_filters = HashMap::new();
        task_filters.insert(
            "label".to_string(),
            vec![format!("{}={}", STACK_NAMESPACE_LABEL, stack)],
        );
        task_filters.insert("desired-state".to_string(), vec!["running".to_string()]);
        let tasks = self
            .client
            .list_tasks(Some(ListTasksOptions {
                filters: Some(task_filters),
            }))
            .await
            .context(ApiSnafu)?;
        let containers = running_containers(&tasks);

        let prefix = format!("{}_", stack);
        let mut statuses: Vec<ServiceReplicaStatus> = services
            .into_iter()
            .filter_map(|service| {
                let full_name = service.spec.as_ref()?.name.clone()?;
                let service_name = full_name
                    .strip_prefix(&prefix)
                    .unwrap_or(&full_name)
                    .to_string();
                let (running, desired) = service
                    .service_status
                    .as_ref()
                    .map(|s| (s.running_tasks.unwrap_or(0), s.desired_tasks.unwrap_or(0)))
                    .unwrap_or((0, 0));
                let published_ports = service
                    .endpoint
                    .as_ref()
                    .and_then(|e| e.ports.as_ref())
                    .map(|ports| {
                        ports
                            .iter()
                            .filter_map(|p| p.published_port)
                            .filter_map(|p| u16::try_from(p).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ServiceReplicaStatus {
                    service_name,
                    running,
                    desired,
                    published_ports,
                    container_id: service
                        .id
                        .as_ref()
                        .and_then(|id| containers.get(id))
                        .cloned(),
                })
            })
            .collect();
        statuses.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(statuses)
    }

    async fn wait_healthy(
        &self,
        stack: &StackName,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<HealthReport, ClusterError> {
        let deadline = Instant::now() + timeout;
        loop {
            if token.is_cancelled() {
                return Err(ClusterError::Aborted);
            }

            let statuses = self.list_service_status(stack).await?;
            let pending: Vec<String> = statuses
                .iter()
                .filter(|s| !s.is_converged())
                .map(|s| s.service_name.clone())
                .collect();

            if !statuses.is_empty() && pending.is_empty() {
                return Ok(HealthReport {
                    healthy: true,
                    failed_services: Vec::new(),
                });
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "Stack {} did not converge within {:?}: {:?}",
                    stack,
                    timeout,
                    pending
                );
                return Ok(HealthReport {
                    healthy: false,
                    failed_services: pending,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = token.cancelled() => return Err(ClusterError::Aborted),
            }
        }
    }

    async fn inject_agent_service(
        &self,
        stack_file: &Path,
        agent: &AgentService,
    ) -> Result<(), ClusterError> {
        let current = Self::read_file(stack_file).await?;
        let updated = inject_agent(&current, agent).context(ComposeSnafu { path: stack_file })?;
        Self::write_file(stack_file, &updated).await
    }
}
