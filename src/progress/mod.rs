// ABOUTME: Deployment progress events and their multi-subscriber broadcaster.
// ABOUTME: Buffers per-application logs so late subscribers can replay them.

mod broadcaster;
mod event;

pub use broadcaster::{ProgressBroadcaster, ProgressCallback, Subscription};
pub use event::{ProgressEvent, Stage};
