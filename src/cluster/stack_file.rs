// ABOUTME: Compose-to-stack file transforms for swarm deployment.
// ABOUTME: Attaches the proxy network, pins build images and injects the tunnel agent.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

use crate::types::StackName;

/// Compose schema version written when the source file omits one.
const STACK_FILE_VERSION: &str = "3.8";

#[derive(Debug, thiserror::Error)]
pub enum StackFileError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Tunnel agent service added to a stack file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentService {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub network: String,
}

/// Image name compose assigns to a build-only service of project `stack`.
pub fn built_image_name(stack: &StackName, service: &str) -> String {
    format!("{}-{}:latest", stack, service)
}

/// Turn a compose document into a stack file for `docker stack deploy`.
pub fn render_stack_file(
    compose: &str,
    stack: &StackName,
    network: &str,
) -> Result<String, StackFileError> {
    let mut doc: Value = serde_yaml::from_str(compose)?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| StackFileError::Invalid("document is not a mapping".to_string()))?;

    let services = root
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| StackFileError::Invalid("no services defined".to_string()))?;

    for (name, definition) in services.iter_mut() {
        let name = name
            .as_str()
            .ok_or_else(|| StackFileError::Invalid("service names must be strings".to_string()))?
            .to_string();
        let Some(service) = definition.as_mapping_mut() else {
            return Err(StackFileError::Invalid(format!(
                "service '{}' is not a mapping",
                name
            )));
        };
        transform_service(service, stack, &name, network);
    }

    if !root.contains_key("version") {
        root.insert("version".into(), STACK_FILE_VERSION.into());
    }

    let networks = root
        .entry("networks".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if networks.is_null() {
        *networks = Value::Mapping(Mapping::new());
    }
    let networks = networks
        .as_mapping_mut()
        .ok_or_else(|| StackFileError::Invalid("top-level networks is not a mapping".to_string()))?;
    let mut external = Mapping::new();
    external.insert("external".into(), true.into());
    external.insert("name".into(), network.into());
    networks.insert(network.into(), Value::Mapping(external));

    Ok(serde_yaml::to_string(&doc)?)
}

fn transform_service(service: &mut Mapping, stack: &StackName, name: &str, network: &str) {
    if service.contains_key("build") {
        if !service.contains_key("image") {
            service.insert("image".into(), built_image_name(stack, name).into());
        }
        service.remove("build");
    }

    // Swarm names containers itself.
    service.remove("container_name");

    if let Some(Value::Mapping(deps)) = service.get("depends_on") {
        let list: Vec<Value> = deps.keys().cloned().collect();
        service.insert("depends_on".into(), Value::Sequence(list));
    }

    match service.get_mut("networks") {
        Some(Value::Sequence(list)) => {
            if !list.iter().any(|n| n.as_str() == Some(network)) {
                list.push(network.into());
            }
        }
        Some(Value::Mapping(map)) => {
            if !map.contains_key(network) {
                map.insert(network.into(), Value::Null);
            }
        }
        _ => {
            service.insert(
                "networks".into(),
                Value::Sequence(vec!["default".into(), network.into()]),
            );
        }
    }
}

/// Add (or replace) the tunnel agent service in a rendered stack file.
pub fn inject_agent(stack_file: &str, agent: &AgentService) -> Result<String, StackFileError> {
    let mut doc: Value = serde_yaml::from_str(stack_file)?;
    let services = doc
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| StackFileError::Invalid("no services defined".to_string()))?;

    let mut environment = Mapping::new();
    for (key, value) in &agent.environment {
        environment.insert(key.as_str().into(), value.as_str().into());
    }

    let mut restart = Mapping::new();
    restart.insert("condition".into(), "any".into());
    let mut deploy = Mapping::new();
    deploy.insert("restart_policy".into(), Value::Mapping(restart));

    let mut service = Mapping::new();
    service.insert("image".into(), agent.image.as_str().into());
    service.insert(
        "command".into(),
        Value::Sequence(agent.command.iter().map(|c| c.as_str().into()).collect()),
    );
    service.insert("environment".into(), Value::Mapping(environment));
    service.insert(
        "networks".into(),
        Value::Sequence(vec![agent.network.as_str().into()]),
    );
    service.insert("deploy".into(), Value::Mapping(deploy));

    services.insert(agent.name.as_str().into(), Value::Mapping(service));
    Ok(serde_yaml::to_string(&doc)?)
}
