// ABOUTME: Secret and environment values that may come from the process environment.
// ABOUTME: Literal strings or `{ env: VAR, default: ... }` references, resolved at load time.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }

    /// Resolve, treating a missing variable or an empty value as unset.
    pub fn resolve_optional(&self) -> Option<String> {
        self.resolve().ok().filter(|v| !v.trim().is_empty())
    }
}

pub fn resolve_env_map(map: &BTreeMap<String, EnvValue>) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| v.resolve().map(|resolved| (k.clone(), resolved)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_resolves_to_itself() {
        let value: EnvValue = serde_yaml::from_str("plain").unwrap();
        assert_eq!(value.resolve().unwrap(), "plain");
    }

    #[test]
    fn env_reference_uses_default_when_unset() {
        let value: EnvValue =
            serde_yaml::from_str("{ env: DOCKYARD_TEST_SURELY_UNSET, default: fallback }")
                .unwrap();
        temp_env::with_var_unset("DOCKYARD_TEST_SURELY_UNSET", || {
            assert_eq!(value.resolve().unwrap(), "fallback");
        });
    }

    #[test]
    fn env_reference_without_default_is_an_error() {
        let value = EnvValue::FromEnv {
            var: "DOCKYARD_TEST_MISSING".to_string(),
            default: None,
        };
        temp_env::with_var_unset("DOCKYARD_TEST_MISSING", || {
            assert!(matches!(value.resolve(), Err(Error::MissingEnvVar(v)) if v == "DOCKYARD_TEST_MISSING"));
            assert!(value.resolve_optional().is_none());
        });
    }
}
