// ABOUTME: Progress event and stage types emitted during a deployment.
// ABOUTME: Stages serialize as lowercase strings for log and JSON consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Starting,
    Ports,
    Infrastructure,
    Building,
    Stack,
    Deploying,
    Health,
    Routing,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Starting => "starting",
            Stage::Ports => "ports",
            Stage::Infrastructure => "infrastructure",
            Stage::Building => "building",
            Stage::Stack => "stack",
            Stage::Deploying => "deploying",
            Stage::Health => "health",
            Stage::Routing => "routing",
            Stage::Done => "done",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    /// `done`, `failed` and `cancelled` close an application's event log.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
