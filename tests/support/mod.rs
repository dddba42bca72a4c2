// ABOUTME: Test support utilities.
// ABOUTME: Recording fakes for the cluster, proxy, DNS provider and notifier, plus a harness.

#![allow(dead_code)]

use async_trait::async_trait;
use nonempty::NonEmpty;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use dockyard::cancel::{CancelToken, DeployContext};
use dockyard::cluster::{
    AgentService, BuildSpec, ClusterDriver, ClusterError, HealthReport, PortCheck,
    ServiceReplicaStatus, StackDeploySpec,
};
use dockyard::deploy::{Collaborators, DeployService, PipelineOptions};
use dockyard::model::{AppService, Application, ExposureMethod, Repository};
use dockyard::notify::{Notification, Notifier};
use dockyard::process::LineSink;
use dockyard::routing::{
    CreatedTunnel, DnsError, DnsProvider, IngressRule, OriginCertificate, ProxyConfig, ProxyError,
    ReverseProxy, RouteOptions, RoutingOptions, Upstream,
};
use dockyard::store::MemoryStore;
use dockyard::types::{ApplicationId, Domain, RepositoryId, StackName, TunnelId};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env().add_directive("dockyard=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Where the fake cluster parks until released or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAt {
    Build,
    Deploy,
}

struct ClusterState {
    calls: Vec<String>,
    port_check: PortCheck,
    statuses: Vec<ServiceReplicaStatus>,
    unhealthy: Vec<String>,
    build_failure: Option<String>,
    block_at: Option<BlockAt>,
    agents: Vec<AgentService>,
}

/// Cluster driver that records every call instead of talking to Docker.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    /// Signalled when a blocking stage has been entered.
    pub blocked: Notify,
    release: Notify,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                calls: Vec::new(),
                port_check: PortCheck {
                    valid: true,
                    conflicts: Vec::new(),
                    allocations: Vec::new(),
                },
                statuses: vec![running("web")],
                unhealthy: Vec::new(),
                build_failure: None,
                block_at: None,
                agents: Vec::new(),
            }),
            blocked: Notify::new(),
            release: Notify::new(),
        }
    }
}

/// A converged single-replica service.
pub fn running(name: &str) -> ServiceReplicaStatus {
    ServiceReplicaStatus {
        service_name: name.to_string(),
        running: 1,
        desired: 1,
        published_ports: Vec::new(),
        container_id: Some(format!("{name}-container")),
    }
}

impl FakeCluster {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn agents(&self) -> Vec<AgentService> {
        self.state.lock().agents.clone()
    }

    pub fn set_port_check(&self, check: PortCheck) {
        self.state.lock().port_check = check;
    }

    pub fn set_statuses(&self, statuses: Vec<ServiceReplicaStatus>) {
        self.state.lock().statuses = statuses;
    }

    pub fn set_unhealthy(&self, services: &[&str]) {
        self.state.lock().unhealthy = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_build(&self, output: &str) {
        self.state.lock().build_failure = Some(output.to_string());
    }

    pub fn block_at(&self, at: BlockAt) {
        self.state.lock().block_at = Some(at);
    }

    /// Let a blocked stage finish normally.
    pub fn release(&self) {
        self.release.notify_one();
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    /// Park like a tracked child process would: until released, killed or cancelled.
    async fn park(&self, at: BlockAt, ctx: &DeployContext) -> Result<(), ClusterError> {
        if self.state.lock().block_at != Some(at) {
            return Ok(());
        }
        let kill = ctx.register_process(None);
        self.blocked.notify_one();
        tokio::select! {
            _ = self.release.notified() => Ok(()),
            _ = kill => Err(ClusterError::Aborted),
            _ = ctx.token().cancelled() => Err(ClusterError::Aborted),
        }
    }
}

#[async_trait]
impl ClusterDriver for FakeCluster {
    async fn ensure_cluster_mode(&self) -> Result<(), ClusterError> {
        self.record("ensure_cluster_mode".to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), ClusterError> {
        self.record(format!("ensure_network:{name}"));
        Ok(())
    }

    async fn validate_and_allocate_ports(
        &self,
        stack: &StackName,
        _compose_file: &Path,
        _env: &BTreeMap<String, String>,
        _auto_allocate: bool,
    ) -> Result<PortCheck, ClusterError> {
        self.record(format!("validate_ports:{stack}"));
        Ok(self.state.lock().port_check.clone())
    }

    async fn build_images(
        &self,
        spec: &BuildSpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError> {
        self.record(format!("build:{}", spec.stack));
        on_line("Step 1/2 : FROM alpine");
        self.park(BlockAt::Build, ctx).await?;
        let failure = self.state.lock().build_failure.clone();
        if let Some(output) = failure {
            return Err(ClusterError::CommandFailed {
                command: "docker compose build".to_string(),
                code: Some(1),
                output,
            });
        }
        on_line("Step 2/2 : COPY . /app");
        Ok(())
    }

    async fn generate_stack_file(
        &self,
        stack: &StackName,
        _compose_file: &Path,
        network: &str,
    ) -> Result<PathBuf, ClusterError> {
        self.record(format!("generate_stack_file:{stack}:{network}"));
        Ok(PathBuf::from(format!("/stacks/{stack}.stack.yml")))
    }

    async fn deploy_stack(
        &self,
        spec: &StackDeploySpec,
        ctx: &DeployContext,
        on_line: LineSink<'_>,
    ) -> Result<(), ClusterError> {
        self.record(format!("deploy_stack:{}", spec.stack));
        on_line(&format!("Creating service {}_web", spec.stack));
        self.park(BlockAt::Deploy, ctx).await
    }

    async fn remove_stack(&self, stack: &StackName) -> Result<(), ClusterError> {
        self.record(format!("remove_stack:{stack}"));
        Ok(())
    }

    async fn list_service_status(
        &self,
        _stack: &StackName,
    ) -> Result<Vec<ServiceReplicaStatus>, ClusterError> {
        Ok(self.state.lock().statuses.clone())
    }

    async fn wait_healthy(
        &self,
        stack: &StackName,
        _timeout: Duration,
        token: &CancelToken,
    ) -> Result<HealthReport, ClusterError> {
        self.record(format!("wait_healthy:{stack}"));
        if token.is_cancelled() {
            return Err(ClusterError::Aborted);
        }
        let unhealthy = self.state.lock().unhealthy.clone();
        Ok(HealthReport {
            healthy: unhealthy.is_empty(),
            failed_services: unhealthy,
        })
    }

    async fn inject_agent_service(
        &self,
        stack_file: &Path,
        agent: &AgentService,
    ) -> Result<(), ClusterError> {
        self.record(format!("inject_agent:{}:{}", stack_file.display(), agent.name));
        self.state.lock().agents.push(agent.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRoute {
    pub app_id: ApplicationId,
    pub domain: String,
    pub upstream: String,
    pub has_certificate: bool,
}

#[derive(Default)]
struct ProxyState {
    running: bool,
    fail_removal: bool,
    never_ready: bool,
    starts: usize,
    routes: Vec<RecordedRoute>,
    removed: Vec<ApplicationId>,
}

/// Reverse proxy that keeps routes in memory.
#[derive(Default)]
pub struct FakeProxy {
    state: Mutex<ProxyState>,
    /// Signalled when our own instance is started.
    pub started: Notify,
}

impl FakeProxy {
    pub fn running() -> Self {
        let proxy = Self::default();
        proxy.state.lock().running = true;
        proxy
    }

    pub fn routes(&self) -> Vec<RecordedRoute> {
        self.state.lock().routes.clone()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn removed(&self) -> Vec<ApplicationId> {
        self.state.lock().removed.clone()
    }

    /// A started instance that never answers its admin API.
    pub fn never_ready() -> Self {
        let proxy = Self::default();
        proxy.state.lock().never_ready = true;
        proxy
    }

    /// Make route removal fail from now on.
    pub fn fail_removal(&self) {
        self.state.lock().fail_removal = true;
    }
}

#[async_trait]
impl ReverseProxy for FakeProxy {
    async fn detect_existing(&self) -> Option<ProxyConfig> {
        self.state.lock().running.then(|| ProxyConfig {
            admin_url: "http://proxy.test:2019".to_string(),
            server: "srv0".to_string(),
        })
    }

    async fn add_route(
        &self,
        _config: &ProxyConfig,
        app_id: &ApplicationId,
        domain: &Domain,
        upstream: &Upstream,
        options: &RouteOptions,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        state.routes.retain(|r| r.domain != domain.as_str());
        state.routes.push(RecordedRoute {
            app_id: app_id.clone(),
            domain: domain.to_string(),
            upstream: upstream.url(),
            has_certificate: options.certificate.is_some(),
        });
        Ok(())
    }

    async fn remove_route(
        &self,
        _config: &ProxyConfig,
        app_id: &ApplicationId,
        _app_name: &str,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        if state.fail_removal {
            return Err(ProxyError::Rejected("route not found".to_string()));
        }
        state.routes.retain(|r| &r.app_id != app_id);
        state.removed.push(app_id.clone());
        Ok(())
    }

    async fn start_own_instance(&self, _admin_email: Option<&str>) -> Result<(), ProxyError> {
        {
            let mut state = self.state.lock();
            state.starts += 1;
            state.running = !state.never_ready;
        }
        self.started.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct DnsState {
    records: Vec<(String, String, IpAddr)>,
    deleted_records: Vec<String>,
    tunnels: Vec<String>,
    deleted_tunnels: Vec<TunnelId>,
    ingress: Vec<(TunnelId, Vec<IngressRule>)>,
    cnames: Vec<(String, TunnelId)>,
    live: Vec<CreatedTunnel>,
    no_public_ip: bool,
    fail_certificates: bool,
    fail_records: bool,
    fail_deletes: bool,
}

/// DNS and tunnel provider with switchable credentials.
pub struct FakeDns {
    dns_configured: bool,
    tunnel_available: bool,
    state: Mutex<DnsState>,
}

pub const PUBLIC_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

impl FakeDns {
    pub fn new(dns_configured: bool, tunnel_available: bool) -> Self {
        Self {
            dns_configured,
            tunnel_available,
            state: Mutex::new(DnsState::default()),
        }
    }

    /// No credentials at all.
    pub fn unconfigured() -> Self {
        Self::new(false, false)
    }

    pub fn records(&self) -> Vec<(String, String, IpAddr)> {
        self.state.lock().records.clone()
    }

    pub fn deleted_records(&self) -> Vec<String> {
        self.state.lock().deleted_records.clone()
    }

    pub fn tunnels(&self) -> Vec<String> {
        self.state.lock().tunnels.clone()
    }

    pub fn deleted_tunnels(&self) -> Vec<TunnelId> {
        self.state.lock().deleted_tunnels.clone()
    }

    pub fn ingress(&self) -> Vec<(TunnelId, Vec<IngressRule>)> {
        self.state.lock().ingress.clone()
    }

    pub fn cnames(&self) -> Vec<(String, TunnelId)> {
        self.state.lock().cnames.clone()
    }

    /// Tunnels created and not yet deleted.
    pub fn live_tunnels(&self) -> Vec<TunnelId> {
        self.state.lock().live.iter().map(|t| t.id.clone()).collect()
    }

    pub fn hide_public_ip(&self) {
        self.state.lock().no_public_ip = true;
    }

    pub fn fail_certificates(&self) {
        self.state.lock().fail_certificates = true;
    }

    pub fn fail_records(&self) {
        self.state.lock().fail_records = true;
    }

    /// Make record and tunnel deletion fail.
    pub fn fail_deletes(&self) {
        self.state.lock().fail_deletes = true;
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    fn dns_configured(&self) -> bool {
        self.dns_configured
    }

    fn tunnel_available(&self) -> bool {
        self.tunnel_available
    }

    async fn detect_public_ip(&self) -> Option<IpAddr> {
        (!self.state.lock().no_public_ip).then_some(PUBLIC_IP)
    }

    async fn issue_origin_cert(&self, root_domain: &str) -> Result<OriginCertificate, DnsError> {
        if self.state.lock().fail_certificates {
            return Err(DnsError::Permission("certificates returned 403".to_string()));
        }
        Ok(OriginCertificate {
            cert_path: PathBuf::from(format!("/certs/{root_domain}.pem")),
            key_path: PathBuf::from(format!("/certs/{root_domain}.key")),
        })
    }

    async fn upsert_dns_record(
        &self,
        subdomain: &str,
        root_domain: &str,
        ip: IpAddr,
    ) -> Result<(), DnsError> {
        let mut state = self.state.lock();
        if state.fail_records {
            return Err(DnsError::Api("record quota exceeded".to_string()));
        }
        state
            .records
            .push((subdomain.to_string(), root_domain.to_string(), ip));
        Ok(())
    }

    async fn delete_dns_record(&self, subdomain: &str, root_domain: &str) -> Result<(), DnsError> {
        let mut state = self.state.lock();
        if state.fail_deletes {
            return Err(DnsError::Api("record delete rejected".to_string()));
        }
        state.deleted_records.push(format!("{subdomain}.{root_domain}"));
        Ok(())
    }

    async fn create_tunnel(&self, name: &str) -> Result<CreatedTunnel, DnsError> {
        let mut state = self.state.lock();
        state.tunnels.push(name.to_string());
        let n = state.tunnels.len();
        let tunnel = CreatedTunnel {
            id: TunnelId::new(format!("tunnel-{n}")),
            name: name.to_string(),
            token: format!("token-{n}"),
        };
        state.live.push(tunnel.clone());
        Ok(tunnel)
    }

    async fn find_tunnel(&self, name: &str) -> Result<Option<CreatedTunnel>, DnsError> {
        Ok(self
            .state
            .lock()
            .live
            .iter()
            .find(|t| t.name == name)
            .cloned())
    }

    async fn configure_ingress(
        &self,
        tunnel_id: &TunnelId,
        rules: &NonEmpty<IngressRule>,
    ) -> Result<(), DnsError> {
        self.state
            .lock()
            .ingress
            .push((tunnel_id.clone(), rules.iter().cloned().collect()));
        Ok(())
    }

    async fn create_cname(
        &self,
        subdomain: &str,
        root_domain: &str,
        tunnel_id: &TunnelId,
    ) -> Result<(), DnsError> {
        self.state
            .lock()
            .cnames
            .push((format!("{subdomain}.{root_domain}"), tunnel_id.clone()));
        Ok(())
    }

    async fn delete_tunnel(&self, tunnel_id: &TunnelId) -> Result<(), DnsError> {
        let mut state = self.state.lock();
        if state.fail_deletes {
            return Err(DnsError::Api("tunnel has active connections".to_string()));
        }
        state.live.retain(|t| &t.id != tunnel_id);
        state.deleted_tunnels.push(tunnel_id.clone());
        Ok(())
    }
}

/// Notifier that keeps what it was sent.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

pub const APP_NAME: &str = "shop";

/// A deploy service wired to fakes, with one application "shop" whose
/// repository holds a compose file in a temporary directory.
pub struct Harness {
    pub service: DeployService,
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<FakeCluster>,
    pub proxy: Arc<FakeProxy>,
    pub dns: Arc<FakeDns>,
    pub notifier: Arc<RecordingNotifier>,
    pub app_id: ApplicationId,
    pub dir: TempDir,
}

pub struct HarnessBuilder {
    dns: Arc<FakeDns>,
    proxy: FakeProxy,
    preserve_routing: bool,
    notifications: bool,
    services: Vec<AppService>,
    compose: bool,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            dns: Arc::new(FakeDns::new(true, true)),
            proxy: FakeProxy::running(),
            preserve_routing: false,
            notifications: true,
            services: Vec::new(),
            compose: true,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }
}

impl HarnessBuilder {
    pub fn dns(mut self, dns: FakeDns) -> Self {
        self.dns = Arc::new(dns);
        self
    }

    /// Use a provider another harness also talks to, like a second process would.
    pub fn shared_dns(mut self, dns: Arc<FakeDns>) -> Self {
        self.dns = dns;
        self
    }

    pub fn without_notifications(mut self) -> Self {
        self.notifications = false;
        self
    }

    pub fn proxy(mut self, proxy: FakeProxy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn preserve_routing(mut self) -> Self {
        self.preserve_routing = true;
        self
    }

    pub fn without_compose_file(mut self) -> Self {
        self.compose = false;
        self
    }

    /// Add a routed service of the "shop" application.
    pub fn routed(
        mut self,
        name: &str,
        port: Option<u16>,
        domain: &str,
        method: ExposureMethod,
    ) -> Self {
        let mut service = AppService::new(ApplicationId::new(APP_NAME), name);
        service.exposed = true;
        service.container_port = port;
        service.domain = Some(domain.to_string());
        service.exposure_method = method;
        self.services.push(service);
        self
    }

    pub fn build(self) -> Harness {
        init_tracing();
        let dir = TempDir::new().unwrap();
        if self.compose {
            std::fs::write(
                dir.path().join("docker-compose.yml"),
                "services:\n  web:\n    image: nginx\n",
            )
            .unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        let app_id = ApplicationId::new(APP_NAME);
        let repo_id = RepositoryId::new("shop-repo");
        store.insert_repository(Repository {
            id: repo_id.clone(),
            name: "shop".to_string(),
            path: dir.path().to_path_buf(),
        });
        let mut app = Application::new(app_id.clone(), APP_NAME, repo_id, "docker-compose.yml");
        app.notifications_enabled = self.notifications;
        store.insert_application(app);
        for service in self.services {
            store.insert_service(service);
        }

        let cluster = Arc::new(FakeCluster::default());
        let proxy = Arc::new(self.proxy);
        let dns = self.dns;
        let notifier = Arc::new(RecordingNotifier::default());
        let collaborators = Collaborators {
            store: store.clone(),
            cluster: cluster.clone(),
            proxy: proxy.clone(),
            dns: dns.clone(),
            notifier: notifier.clone(),
        };
        let options = PipelineOptions {
            network: "dockyard".to_string(),
            health_timeout: Duration::from_secs(30),
            preserve_routing: self.preserve_routing,
            routing: RoutingOptions {
                network: "dockyard".to_string(),
                admin_email: None,
                tunnel_agent_image: "cloudflare/cloudflared:latest".to_string(),
                host_name: "node1".to_string(),
            },
        };

        Harness {
            service: DeployService::new(collaborators, options),
            store,
            cluster,
            proxy,
            dns,
            notifier,
            app_id,
            dir,
        }
    }
}
