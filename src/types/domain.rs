// ABOUTME: Parsed public hostname for an exposed service.
// ABOUTME: Splits a domain into the record name and the root zone it lives in.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain cannot be empty")]
    Empty,

    #[error("domain must contain at least two labels: {0}")]
    NoRoot(String),

    #[error("domain contains an empty label: {0}")]
    EmptyLabel(String),

    #[error("invalid character in domain: '{0}'")]
    InvalidChar(char),
}

/// A hostname such as `api.example.com`.
///
/// The root domain is the last two labels (`example.com`); everything before
/// it is the subdomain used as the DNS record name (`api`). An apex domain has
/// the subdomain `@`.
///
/// The split knows nothing about public suffixes: `app.example.co.uk` gets the
/// root `co.uk`. Providers that need the real zone resolve it themselves from
/// the full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    full: String,
    split: usize,
}

impl Domain {
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let full = input.trim().trim_end_matches('.').to_ascii_lowercase();
        if full.is_empty() {
            return Err(DomainError::Empty);
        }

        for c in full.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
                return Err(DomainError::InvalidChar(c));
            }
        }

        let labels: Vec<&str> = full.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(DomainError::EmptyLabel(full));
        }
        if labels.len() < 2 {
            return Err(DomainError::NoRoot(full));
        }

        let root_len = labels[labels.len() - 2].len() + labels[labels.len() - 1].len() + 1;
        let split = full.len() - root_len;
        Ok(Self { full, split })
    }

    /// The full hostname.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The zone the record lives in, e.g. `example.com`.
    pub fn root(&self) -> &str {
        &self.full[self.split..]
    }

    /// The record name inside the root zone, `@` for the apex.
    pub fn subdomain(&self) -> &str {
        if self.split == 0 {
            "@"
        } else {
            &self.full[..self.split - 1]
        }
    }

    /// The left-most label of the hostname.
    pub fn label(&self) -> &str {
        self.full.split('.').next().unwrap_or(&self.full)
    }

    pub fn is_apex(&self) -> bool {
        self.split == 0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full)
    }
}
