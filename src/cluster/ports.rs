// ABOUTME: Host port extraction from compose files and conflict resolution.
// ABOUTME: Conflicting ports set through a variable can be reassigned from a range.

use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;

use super::stack_file::StackFileError;

/// A host port a service asks to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub service: String,
    pub host_port: u16,
    pub container_port: Option<u16>,
    /// Variable the host port was read from, if any.
    pub env_var: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub service: String,
    pub port: u16,
    pub env_var: Option<String>,
}

impl std::fmt::Display for PortConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(
                f,
                "service '{}' port {} (set via {})",
                self.service, self.port, var
            ),
            None => write!(f, "service '{}' port {}", self.service, self.port),
        }
    }
}

/// A conflicting port moved to a free one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub service: String,
    pub env_var: String,
    pub from: u16,
    pub to: u16,
}

/// Outcome of port validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortCheck {
    pub valid: bool,
    pub conflicts: Vec<PortConflict>,
    pub allocations: Vec<PortAllocation>,
}

/// Read every published host port from a compose document.
///
/// Variables resolve against `env` first, then their inline default.
/// Entries without a host port or with port ranges are skipped.
pub fn requested_ports(
    compose: &str,
    env: &BTreeMap<String, String>,
) -> Result<Vec<PortRequest>, StackFileError> {
    let doc: Value = serde_yaml::from_str(compose)?;
    let Some(services) = doc.get("services").and_then(Value::as_mapping) else {
        return Err(StackFileError::Invalid("no services defined".to_string()));
    };

    let mut requests = Vec::new();
    for (name, service) in services {
        let Some(name) = name.as_str() else { continue };
        let Some(ports) = service.get("ports").and_then(Value::as_sequence) else {
            continue;
        };
        for entry in ports {
            let parsed = match entry {
                Value::String(s) => parse_short(s, env),
                Value::Number(n) => n
                    .as_u64()
                    .map(|p| p.to_string())
                    .and_then(|p| parse_short(&p, env)),
                Value::Mapping(_) => parse_long(entry, env),
                _ => None,
            };
            if let Some((host_port, container_port, env_var)) = parsed {
                requests.push(PortRequest {
                    service: name.to_string(),
                    host_port,
                    container_port,
                    env_var,
                });
            }
        }
    }
    Ok(requests)
}

type ParsedPort = (u16, Option<u16>, Option<String>);

fn parse_short(spec: &str, env: &BTreeMap<String, String>) -> Option<ParsedPort> {
    let spec = spec.split('/').next().unwrap_or(spec);
    let parts = split_outside_braces(spec);
    if parts.len() < 2 {
        return None;
    }
    let raw_host = parts[parts.len() - 2];
    let raw_container = parts[parts.len() - 1];

    let host_port = interpolate(raw_host, env).trim().parse::<u16>().ok()?;
    let container_port = interpolate(raw_container, env).trim().parse::<u16>().ok();
    Some((host_port, container_port, variable_name(raw_host)))
}

fn parse_long(entry: &Value, env: &BTreeMap<String, String>) -> Option<ParsedPort> {
    let published = entry.get("published")?;
    let (raw, host_port) = match published {
        Value::Number(n) => (None, u16::try_from(n.as_u64()?).ok()?),
        Value::String(s) => (Some(s.as_str()), interpolate(s, env).trim().parse().ok()?),
        _ => return None,
    };
    let container_port = entry
        .get("target")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());
    Some((host_port, container_port, raw.and_then(variable_name)))
}

/// Split on `:` while leaving `${...}` intact.
fn split_outside_braces(spec: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in spec.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                parts.push(&spec[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);
    parts
}

/// Name of the variable a port field consists of, e.g. `${WEB_PORT:-8080}`.
fn variable_name(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let name = if let Some(inner) = raw.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        inner
            .split(|c: char| c == ':' || c == '-')
            .next()
            .unwrap_or(inner)
    } else {
        raw.strip_prefix('$')?
    };
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| name.to_string())
}

/// Expand `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR-default}`.
pub fn interpolate(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(body) = rest.strip_prefix('{') {
            let Some(end) = body.find('}') else {
                out.push_str("${");
                rest = body;
                continue;
            };
            out.push_str(&expand(&body[..end], env));
            rest = &body[end + 1..];
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if end == 0 {
                out.push('$');
                continue;
            }
            out.push_str(env.get(&rest[..end]).map(String::as_str).unwrap_or(""));
            rest = &rest[end..];
        }
    }
    out.push_str(rest);
    out
}

fn expand(expr: &str, env: &BTreeMap<String, String>) -> String {
    if let Some((name, default)) = expr.split_once(":-") {
        return match env.get(name) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => default.to_string(),
        };
    }
    if let Some((name, default)) = expr.split_once('-') {
        return env.get(name).cloned().unwrap_or_else(|| default.to_string());
    }
    env.get(expr).cloned().unwrap_or_default()
}

/// Validate requested ports, optionally moving conflicts into `range`.
///
/// Only ports set through a variable can be moved; a literal conflicting
/// port always leaves the check invalid.
pub fn check_ports(
    requests: &[PortRequest],
    auto_allocate: bool,
    range: RangeInclusive<u16>,
    is_free: impl Fn(u16) -> bool,
) -> PortCheck {
    let requested: HashSet<u16> = requests.iter().map(|r| r.host_port).collect();
    let mut taken: HashSet<u16> = HashSet::new();
    let mut check = PortCheck::default();

    for request in requests {
        let port = request.host_port;
        if !taken.contains(&port) && is_free(port) {
            taken.insert(port);
            continue;
        }

        let replacement = match (&request.env_var, auto_allocate) {
            (Some(var), true) => range
                .clone()
                .find(|p| !taken.contains(p) && !requested.contains(p) && is_free(*p))
                .map(|p| (var.clone(), p)),
            _ => None,
        };

        match replacement {
            Some((env_var, to)) => {
                taken.insert(to);
                check.allocations.push(PortAllocation {
                    service: request.service.clone(),
                    env_var,
                    from: port,
                    to,
                });
            }
            None => check.conflicts.push(PortConflict {
                service: request.service.clone(),
                port,
                env_var: request.env_var.clone(),
            }),
        }
    }

    check.valid = check.conflicts.is_empty();
    check
}

/// Probe a host port by binding it.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
