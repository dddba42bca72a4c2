// ABOUTME: The deployment service owning every collaborator the pipeline sequences.
// ABOUTME: One instance per process; holds the routing cache, broadcaster and registry.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancellationRegistry;
use crate::cluster::ClusterDriver;
use crate::notify::Notifier;
use crate::progress::ProgressBroadcaster;
use crate::routing::{DnsProvider, ReverseProxy, RoutingConfigurator, RoutingOptions};
use crate::store::Store;
use crate::types::DeploymentId;

/// External collaborators the service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub cluster: Arc<dyn ClusterDriver>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub dns: Arc<dyn DnsProvider>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Overlay network every stack joins.
    pub network: String,
    pub health_timeout: Duration,
    /// Keep routes and DNS records when an application is stopped.
    pub preserve_routing: bool,
    pub routing: RoutingOptions,
}

pub struct DeployService {
    pub(super) store: Arc<dyn Store>,
    pub(super) cluster: Arc<dyn ClusterDriver>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) routing: RoutingConfigurator,
    pub(super) broadcaster: Arc<ProgressBroadcaster>,
    pub(super) registry: CancellationRegistry,
    pub(super) options: PipelineOptions,
}

impl DeployService {
    pub fn new(collaborators: Collaborators, options: PipelineOptions) -> Self {
        let Collaborators {
            store,
            cluster,
            proxy,
            dns,
            notifier,
        } = collaborators;
        let routing = RoutingConfigurator::new(
            proxy,
            dns,
            Arc::clone(&cluster),
            Arc::clone(&store),
            options.routing.clone(),
        );
        Self {
            store,
            cluster,
            notifier,
            routing,
            broadcaster: Arc::new(ProgressBroadcaster::new()),
            registry: CancellationRegistry::new(),
            options,
        }
    }

    /// The broadcaster progress subscribers attach to.
    pub fn progress(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn routing(&self) -> &RoutingConfigurator {
        &self.routing
    }

    /// Request cancellation of an in-flight deployment.
    ///
    /// Tracked processes are killed right away; the pipeline notices the
    /// signal at its next stage boundary. Returns false when no deployment
    /// with that id is running.
    pub fn cancel(&self, deployment_id: &DeploymentId) -> bool {
        self.registry.cancel(deployment_id)
    }
}
