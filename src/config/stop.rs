// ABOUTME: Policy applied when an application is stopped.
// ABOUTME: Controls whether routes and DNS records survive a stop.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopSettings {
    /// Keep reverse-proxy routes and DNS records so a later redeploy is
    /// reachable again without re-provisioning them.
    #[serde(default)]
    pub preserve_routing: bool,
}
