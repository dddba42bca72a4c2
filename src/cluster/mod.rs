// ABOUTME: Cluster driver abstraction over the swarm orchestrator.
// ABOUTME: Build, stack deploy, health polling and port validation behind one trait.

mod error;
pub mod ports;
pub mod stack_file;
mod swarm;

pub use error::{
    AbortedSnafu, ApiSnafu, ClusterError, ClusterErrorKind, CommandFailedSnafu, ComposeSnafu,
    FileSnafu, SpawnSnafu,
};
pub use ports::{PortAllocation, PortCheck, PortConflict, PortRequest};
pub use stack_file::{AgentService, StackFileError};
pub use swarm::{SwarmDriver, SwarmOptions};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::{CancelToken, DeployContext};
use crate::process::LineSink;
use crate::types::StackName;

/// Inputs for building a stack's images.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub stack: StackName,
    pub compose_file: PathBuf,
    pub project_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Inputs for deploying a rendered stack file.
#[derive(Debug, Clone)]
pub struct StackDeploySpec {
    pub stack: StackName,
    pub stack_file: PathBuf,
    pub project_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Replica counts of one stack service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReplicaStatus {
    /// Compose service name, without the stack prefix.
    pub service_name: String,
    pub running: u64,
    pub desired: u64,
    pub published_ports: Vec<u16>,
    pub container_id: Option<String>,
}

impl ServiceReplicaStatus {
    pub fn is_converged(&self) -> bool {
        self.running >= self.desired
    }

    /// Replica summary like `1/1`.
    pub fn replicas(&self) -> String {
        format!("{}/{}", self.running, self.desired)
    }
}

/// Result of waiting for a stack to converge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    /// Services that had not converged when the wait ended.
    pub failed_services: Vec<String>,
}

/// Orchestrator operations needed by the deployment pipeline.
///
/// Operations taking a [`DeployContext`] spawn tracked processes and return
/// [`ClusterError::Aborted`] when the deployment is cancelled underneath them.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Put the host into swarm mode if it is not already.
    async fn ensure_cluster_mode(&self) -> Result<(), ClusterError>;

    /// Create the attachable overlay network shared with the reverse proxy.
    async fn ensure_network(&self, name: &str) -> Result<(), ClusterError>;

    /// Check the host ports a compose file publishes.
    ///
    /// Ports currently published by `stack` itself count as free so a
    /// redeploy does not conflict with its own previous release.
    async fn validate_and_allocate_ports(
        &self,
        stack: &StackName,
        compose_file: &Path,
        env: &BTreeMap<String, String>,
        auto_allocate: bool,
    ) -> Result<PortCheck, ClusterError>;

    async fn build_images(
        &self,
        spec: &BuildSpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError>;

    /// Render the compose file into a stack file and return its path.
    async fn generate_stack_file(
        &self,
        stack: &StackName,
        compose_file: &Path,
        network: &str,
    ) -> Result<PathBuf, ClusterError>;

    async fn deploy_stack(
        &self,
        spec: &StackDeploySpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError>;

    async fn remove_stack(&self, stack: &StackName) -> Result<(), ClusterError>;

    async fn list_service_status(
        &self,
        stack: &StackName,
    ) -> Result<Vec<ServiceReplicaStatus>, ClusterError>;

    /// Poll until every service has its desired replicas or `timeout` passes.
    ///
    /// A timeout is reported as an unhealthy report, cancellation as
    /// [`ClusterError::Aborted`].
    async fn wait_healthy(
        &self,
        stack: &StackName,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<HealthReport, ClusterError>;

    /// Add the tunnel agent service to an existing stack file.
    async fn inject_agent_service(
        &self,
        stack_file: &Path,
        agent: &AgentService,
    ) -> Result<(), ClusterError>;
}
