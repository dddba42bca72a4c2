// ABOUTME: DNS-compatible stack name validation.
// ABOUTME: Ensures stack names follow RFC 1123 label requirements.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackNameError {
    #[error("stack name cannot be empty")]
    Empty,

    #[error("stack name exceeds maximum length of 63 characters")]
    TooLong,

    #[error("stack name cannot start with a hyphen")]
    StartsWithHyphen,

    #[error("stack name cannot end with a hyphen")]
    EndsWithHyphen,

    #[error("stack name must be lowercase")]
    NotLowercase,

    #[error("invalid character in stack name: '{0}'")]
    InvalidChar(char),
}

/// Name of the cluster stack an application is deployed as.
///
/// Swarm prefixes every service with `<stack>_`, and that prefix doubles as the
/// service's DNS name on the overlay network, so the stack name must be a valid
/// DNS label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackName(String);

impl StackName {
    pub const MAX_LEN: usize = 63;

    pub fn new(value: &str) -> Result<Self, StackNameError> {
        if value.is_empty() {
            return Err(StackNameError::Empty);
        }

        if value.len() > Self::MAX_LEN {
            return Err(StackNameError::TooLong);
        }

        if value.starts_with('-') {
            return Err(StackNameError::StartsWithHyphen);
        }

        if value.ends_with('-') {
            return Err(StackNameError::EndsWithHyphen);
        }

        for c in value.chars() {
            if c.is_ascii_uppercase() {
                return Err(StackNameError::NotLowercase);
            }
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(StackNameError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    /// Derive a stack name from a free-form application name.
    ///
    /// Lowercases, maps every run of other characters to a single hyphen, trims
    /// hyphens at both ends and truncates to the label limit.
    pub fn from_app_name(name: &str) -> Result<Self, StackNameError> {
        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                out.push(c);
            } else if !out.ends_with('-') {
                out.push('-');
            }
        }
        let mut trimmed: String = out.trim_matches('-').to_string();
        if trimmed.len() > Self::MAX_LEN {
            trimmed.truncate(Self::MAX_LEN);
            trimmed = trimmed.trim_end_matches('-').to_string();
        }
        Self::new(&trimmed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cluster-internal name of one of this stack's services.
    pub fn service_host(&self, service: &str) -> String {
        format!("{}_{}", self.0, service)
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
