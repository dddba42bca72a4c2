// ABOUTME: Per-application tunnel record.
// ABOUTME: Created lazily on the first tunnel-exposed deploy, deleted on stop.

use serde::{Deserialize, Serialize};

use crate::types::{ApplicationId, TunnelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Inactive,
    Active,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub application_id: ApplicationId,
    /// Provider-side tunnel id.
    pub tunnel_id: TunnelId,
    pub name: String,
    /// Agent credential. Never printed.
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(default)]
    pub status: TunnelStatus,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("application_id", &self.application_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("name", &self.name)
            .field("status", &self.status)
            .finish()
    }
}
