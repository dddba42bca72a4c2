// ABOUTME: Deployment orchestration: the pipeline, stop, rollback and cancellation.
// ABOUTME: DeployService sequences cluster, routing, progress and persistence.

mod error;
mod log;
mod pipeline;
mod rollback;
mod service;
mod stop;

pub use error::{DeployError, DeployErrorKind};
pub use log::{BuildLog, MAX_LOG_BYTES};
pub use pipeline::DeployOutcome;
pub use service::{Collaborators, DeployService, PipelineOptions};
pub use stop::StopReport;
