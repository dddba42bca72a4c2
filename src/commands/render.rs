// ABOUTME: Render command implementation.
// ABOUTME: Writes the stack file a deploy would use and prints its path.

use dockyard::cluster::{ClusterDriver, SwarmDriver};
use dockyard::config::{AppManifest, Settings};
use dockyard::error::{Error, Result};
use dockyard::output::Output;
use dockyard::types::StackName;

pub async fn render(settings: Settings, manifest: AppManifest, output: Output) -> Result<()> {
    let stack = StackName::from_app_name(&manifest.app.name)
        .map_err(|e| Error::InvalidConfig(format!("app.name: {}", e)))?;
    let compose_file = manifest.repository.path.join(&manifest.app.compose);
    let driver = SwarmDriver::connect(settings.swarm_options())?;
    let path = driver
        .generate_stack_file(&stack, &compose_file, &settings.network)
        .await?;
    output.success(&path.display().to_string());
    Ok(())
}
