// ABOUTME: Records the deployment engine reads and mutates.
// ABOUTME: Applications, services, deployment history and tunnels.

mod application;
mod deployment;
mod tunnel;

pub use application::{AppService, AppStatus, Application, ExposureMethod, Repository, ServiceStatus};
pub use deployment::{CommitInfo, DeployedBy, Deployment, DeploymentFinish, DeploymentStatus};
pub use tunnel::{Tunnel, TunnelStatus};
