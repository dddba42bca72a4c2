// ABOUTME: Per-deployment cancellation contexts and the registry that owns them.
// ABOUTME: Each context carries a cancel token plus kill handles for spawned processes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, oneshot};

use crate::types::DeploymentId;

/// Sentinel raised at a stage boundary once cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deployment cancelled")]
pub struct Cancelled;

/// Cooperative cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Stage-boundary guard.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Kill handle for one spawned child process.
struct TrackedProcess {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

/// Receiver side handed to the code that owns the child.
///
/// Resolves when the deployment is cancelled; the owner then kills the child.
pub type KillSignal = oneshot::Receiver<()>;

/// Cancellation state of one in-flight deployment.
pub struct DeployContext {
    deployment_id: DeploymentId,
    token: CancelToken,
    processes: Mutex<Vec<TrackedProcess>>,
}

impl std::fmt::Debug for DeployContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployContext")
            .field("deployment_id", &self.deployment_id)
            .field("cancelled", &self.token.is_cancelled())
            .field("processes", &self.processes.lock().len())
            .finish()
    }
}

impl DeployContext {
    pub fn new(deployment_id: DeploymentId) -> Self {
        Self {
            deployment_id,
            token: CancelToken::new(),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// Register a freshly spawned child.
    ///
    /// If the deployment was already cancelled the returned signal fires
    /// immediately, so a process spawned after cancellation dies at once.
    pub fn register_process(&self, pid: Option<u32>) -> KillSignal {
        let (kill, signal) = oneshot::channel();
        let mut processes = self.processes.lock();
        if self.token.is_cancelled() {
            let _ = kill.send(());
        } else {
            processes.retain(|p| !p.kill.is_closed());
            processes.push(TrackedProcess { pid, kill });
        }
        signal
    }

    /// Number of tracked processes whose owner is still waiting on them.
    pub fn live_processes(&self) -> usize {
        self.processes
            .lock()
            .iter()
            .filter(|p| !p.kill.is_closed())
            .count()
    }

    /// Kill every tracked process, then signal the token.
    pub fn cancel(&self) -> usize {
        let processes: Vec<TrackedProcess> = {
            let mut guard = self.processes.lock();
            // Flip the token while holding the lock so no process can slip
            // in between draining and signalling.
            self.token.inner.cancelled.store(true, Ordering::SeqCst);
            guard.drain(..).collect()
        };

        let mut killed = 0;
        for process in processes {
            if process.kill.send(()).is_ok() {
                tracing::debug!(
                    "Killing process {:?} of deployment {}",
                    process.pid,
                    self.deployment_id
                );
                killed += 1;
            }
        }
        self.token.cancel();
        killed
    }
}

/// Tracks the cancellation context of every in-flight deployment.
#[derive(Default)]
pub struct CancellationRegistry {
    contexts: Mutex<HashMap<DeploymentId, Arc<DeployContext>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, deployment_id: &DeploymentId) -> Arc<DeployContext> {
        let context = Arc::new(DeployContext::new(deployment_id.clone()));
        self.contexts
            .lock()
            .insert(deployment_id.clone(), Arc::clone(&context));
        context
    }

    pub fn get(&self, deployment_id: &DeploymentId) -> Option<Arc<DeployContext>> {
        self.contexts.lock().get(deployment_id).cloned()
    }

    pub fn is_active(&self, deployment_id: &DeploymentId) -> bool {
        self.contexts.lock().contains_key(deployment_id)
    }

    /// Request cancellation. Returns false when nothing is in flight under that id.
    pub fn cancel(&self, deployment_id: &DeploymentId) -> bool {
        let Some(context) = self.get(deployment_id) else {
            return false;
        };
        let killed = context.cancel();
        tracing::info!(
            "Cancellation requested for deployment {} ({} process(es) killed)",
            deployment_id,
            killed
        );
        true
    }

    /// Drop tracking for a finished deployment.
    pub fn release(&self, deployment_id: &DeploymentId) {
        self.contexts.lock().remove(deployment_id);
    }
}
