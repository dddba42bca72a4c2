// ABOUTME: Application-wide error types for configuration and the CLI.
// ABOUTME: Pipeline failures have their own taxonomy in deploy::DeployError.

use std::path::PathBuf;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::deploy::DeployError;
use crate::routing::DnsError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    #[error("DNS provider: {0}")]
    Dns(#[from] DnsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
