// ABOUTME: Stop command implementation.
// ABOUTME: Removes the application's stack and reports cleanup warnings.

use dockyard::config::{AppManifest, Settings};
use dockyard::error::Result;
use dockyard::output::Output;
use dockyard::store::MemoryStore;
use std::sync::Arc;

use super::build_service;

pub async fn stop(settings: Settings, manifest: AppManifest, mut output: Output) -> Result<()> {
    output.start_timer();
    let store = Arc::new(MemoryStore::new());
    let app_id = manifest.seed(&store)?;
    let service = build_service(&settings, store)?;

    output.progress(&format!("Stopping {}", manifest.app.name));
    let report = service.stop(&app_id).await?;

    if report.routing_removed {
        output.progress("  → Routes and DNS records removed");
    } else {
        output.progress("  → Routes and DNS records kept");
    }
    for warning in &report.warnings {
        output.warning(&warning.message);
    }
    output.success(&format!("Stopped {}", manifest.app.name));
    Ok(())
}
