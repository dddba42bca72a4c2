// ABOUTME: Phantom-typed identifiers for persisted records.
// ABOUTME: Prevents mixing application, repository, deployment and tunnel IDs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker types for phantom type parameters.
/// Using empty enums prevents instantiation and requires no trait bounds.
pub enum ApplicationMarker {}
pub enum RepositoryMarker {}
pub enum DeploymentMarker {}
pub enum TunnelMarker {}

/// A type-safe identifier that prevents accidental mixing of different ID types.
///
/// A `DeploymentId` cannot be passed where an `ApplicationId` is expected, which
/// matters here because the cancellation registry is keyed by deployment while
/// the progress broadcaster is keyed by application.
#[must_use = "IDs reference records and should not be ignored"]
pub struct Id<T> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }
}

// Manual trait implementations that don't require T to implement the trait.

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.value).finish()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

pub type ApplicationId = Id<ApplicationMarker>;
pub type RepositoryId = Id<RepositoryMarker>;
pub type DeploymentId = Id<DeploymentMarker>;
pub type TunnelId = Id<TunnelMarker>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_compare_by_value() {
        assert_eq!(ApplicationId::new("app-1"), ApplicationId::new("app-1"));
        assert_ne!(ApplicationId::new("app-1"), ApplicationId::new("app-2"));
    }

    #[test]
    fn ids_hash_by_value() {
        let mut set = HashSet::new();
        set.insert(DeploymentId::new("dep-1"));
        assert!(set.contains(&DeploymentId::new("dep-1")));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&TunnelId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: TunnelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "abc");
    }
}
