// ABOUTME: Type-safe identifiers and validated domain types.
// ABOUTME: Uses phantom types to prevent ID confusion at compile time.

mod domain;
mod id;
mod stack_name;

pub use domain::{Domain, DomainError};
pub use id::{ApplicationId, DeploymentId, Id, RepositoryId, TunnelId};
pub use stack_name::{StackName, StackNameError};
