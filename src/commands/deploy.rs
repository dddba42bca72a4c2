// ABOUTME: Deploy command implementation.
// ABOUTME: Streams pipeline progress and turns Ctrl-C into cooperative cancellation.

use dockyard::config::{AppManifest, Settings};
use dockyard::error::Result;
use dockyard::model::DeployedBy;
use dockyard::output::Output;
use dockyard::progress::{ProgressCallback, ProgressEvent};
use dockyard::store::{MemoryStore, Store};
use std::sync::Arc;

use super::build_service;

pub async fn deploy(settings: Settings, manifest: AppManifest, mut output: Output) -> Result<()> {
    output.start_timer();
    let store = Arc::new(MemoryStore::new());
    let app_id = manifest.seed(&store)?;
    let service = Arc::new(build_service(&settings, Arc::clone(&store))?);

    output.progress(&format!("Deploying {}", manifest.app.name));

    let printer = output.clone();
    let callback: ProgressCallback = Arc::new(move |event: &ProgressEvent| printer.event(event));

    let interrupt = {
        let service = Arc::clone(&service);
        let store = Arc::clone(&store);
        let app_id = app_id.clone();
        let output = output.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            output.progress("Interrupted, cancelling deployment...");
            if let Ok(deployments) = store.list_deployments(&app_id).await {
                for deployment in deployments.iter().filter(|d| !d.status.is_terminal()) {
                    service.cancel(&deployment.id);
                }
            }
        })
    };

    let outcome = service
        .deploy(&app_id, DeployedBy::Manual, Some(callback))
        .await;
    interrupt.abort();

    for warning in &outcome.warnings {
        output.warning(&warning.message);
    }

    match outcome.error {
        None => {
            let message = service
                .progress()
                .final_event(&app_id)
                .map(|event| event.message)
                .unwrap_or_else(|| "Deployment complete".to_string());
            output.success(&message);
            Ok(())
        }
        Some(e) => Err(e.into()),
    }
}
