// ABOUTME: Compile-fail test verifying ApplicationId and DeploymentId are not interchangeable.
// ABOUTME: This test should fail to compile, validating type safety.

use dockyard::types::{ApplicationId, DeploymentId};

fn takes_deployment_id(_id: DeploymentId) {}

fn main() {
    let app_id = ApplicationId::new("shop");
    takes_deployment_id(app_id); // ERROR: expected DeploymentId, found ApplicationId
}
