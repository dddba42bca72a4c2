// ABOUTME: Command module aggregator for the dockyard CLI.
// ABOUTME: Loads settings and manifests and wires the production collaborators.

mod deploy;
mod render;
mod stop;

pub use deploy::deploy;
pub use render::render;
pub use stop::stop;

use dockyard::cluster::SwarmDriver;
use dockyard::config::{AppManifest, Settings};
use dockyard::deploy::{Collaborators, DeployService};
use dockyard::error::Result;
use dockyard::notify::TracingNotifier;
use dockyard::routing::{CaddyProxy, CloudflareProvider};
use dockyard::store::MemoryStore;
use std::env;
use std::path::Path;
use std::sync::Arc;

/// Settings from an explicit file, else discovered in the working directory.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None => Settings::discover_or_default(&env::current_dir()?),
    }
}

pub fn load_manifest(path: &Path) -> Result<AppManifest> {
    AppManifest::load(path)
}

/// Build a deployment service backed by Docker Swarm, Caddy and Cloudflare.
pub fn build_service(settings: &Settings, store: Arc<MemoryStore>) -> Result<DeployService> {
    let cluster = SwarmDriver::connect(settings.swarm_options())?;
    let proxy = CaddyProxy::new(settings.caddy_options());
    let dns = CloudflareProvider::new(settings.cloudflare_options())?;
    let collaborators = Collaborators {
        store,
        cluster: Arc::new(cluster),
        proxy: Arc::new(proxy),
        dns: Arc::new(dns),
        notifier: Arc::new(TracingNotifier),
    };
    Ok(DeployService::new(collaborators, settings.pipeline_options()))
}
