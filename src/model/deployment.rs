// ABOUTME: Append-only deployment history records.
// ABOUTME: One record per attempt, created pending and finished exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ApplicationId, DeploymentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Pending)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Running => write!(f, "running"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What triggered a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployedBy {
    Manual,
    Auto,
    Rollback,
}

impl fmt::Display for DeployedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployedBy::Manual => write!(f, "manual"),
            DeployedBy::Auto => write!(f, "auto"),
            DeployedBy::Rollback => write!(f, "rollback"),
        }
    }
}

/// HEAD commit of a repository at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: ApplicationId,
    pub status: DeploymentStatus,
    pub deployed_by: DeployedBy,
    #[serde(default)]
    pub build_log: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal update applied to a pending deployment.
#[derive(Debug, Clone)]
pub struct DeploymentFinish {
    pub status: DeploymentStatus,
    pub build_log: String,
    pub commit: Option<CommitInfo>,
    pub error: Option<String>,
}
