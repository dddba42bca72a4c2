// ABOUTME: Integration tests for the deployment pipeline against recording fakes.
// ABOUTME: Covers success, precondition rejection, stage failure, cancellation and progress replay.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dockyard::cluster::{PortAllocation, PortCheck, PortConflict};
use dockyard::deploy::{DeployError, DeployErrorKind};
use dockyard::diagnostics::WarningKind;
use dockyard::model::{
    AppStatus, DeployedBy, DeploymentFinish, DeploymentStatus, ExposureMethod, ServiceStatus,
    TunnelStatus,
};
use dockyard::notify::NotificationKind;
use dockyard::progress::{ProgressCallback, ProgressEvent, Stage};
use dockyard::routing::CATCH_ALL_SERVICE;
use dockyard::store::{Store, StoreError};
use dockyard::types::DeploymentId;

use support::{BlockAt, FakeDns, FakeProxy, Harness, PUBLIC_IP, running};

async fn app_status(h: &Harness) -> AppStatus {
    h.store
        .get_application(&h.app_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

fn stages(events: &[ProgressEvent]) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::new();
    for event in events {
        if stages.last() != Some(&event.stage) {
            stages.push(event.stage);
        }
    }
    stages
}

#[tokio::test]
async fn dns_deploy_routes_and_records_everything() {
    let h = Harness::builder()
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    assert!(outcome.warnings.is_empty());
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.deployed_by, DeployedBy::Manual);
    assert!(deployment.completed_at.is_some());
    assert!(deployment.build_log.contains("[building] Step 1/2 : FROM alpine"));
    assert_eq!(app_status(&h).await, AppStatus::Running);

    assert_eq!(
        h.cluster.calls(),
        vec![
            "validate_ports:shop",
            "ensure_cluster_mode",
            "ensure_network:dockyard",
            "build:shop",
            "generate_stack_file:shop:dockyard",
            "deploy_stack:shop",
            "wait_healthy:shop",
        ]
    );

    let routes = h.proxy.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].domain, "shop.example.com");
    assert_eq!(routes[0].upstream, "http://shop_web:80");
    assert!(routes[0].has_certificate);
    assert_eq!(
        h.dns.records(),
        vec![("shop".to_string(), "example.com".to_string(), PUBLIC_IP)]
    );

    let services = h.store.list_services(&h.app_id).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].status, ServiceStatus::Running);
    assert_eq!(services[0].container_id.as_deref(), Some("web-container"));

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Success);
}

#[tokio::test]
async fn stages_run_in_order_and_end_with_done() {
    let h = Harness::builder()
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    assert!(outcome.success);

    let events = h.service.progress().events(&h.app_id);
    assert_eq!(
        stages(&events),
        vec![
            Stage::Starting,
            Stage::Ports,
            Stage::Infrastructure,
            Stage::Building,
            Stage::Stack,
            Stage::Deploying,
            Stage::Health,
            Stage::Routing,
            Stage::Done,
        ]
    );
    assert_eq!(events.iter().filter(|e| e.stage.is_terminal()).count(), 1);
}

#[tokio::test]
async fn deploy_while_building_creates_no_deployment() {
    let h = Harness::new();
    h.store
        .set_app_status(&h.app_id, AppStatus::Building)
        .await
        .unwrap();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!outcome.success);
    assert!(outcome.deployment.is_none());
    assert!(matches!(outcome.error, Some(DeployError::AlreadyBuilding(_))));
    assert_eq!(h.store.deployment_count(), 0);
    assert!(h.cluster.calls().is_empty());
    assert_eq!(app_status(&h).await, AppStatus::Building);
}

#[tokio::test]
async fn unknown_application_is_rejected() {
    let h = Harness::new();
    let outcome = h
        .service
        .deploy(
            &dockyard::types::ApplicationId::new("ghost"),
            DeployedBy::Manual,
            None,
        )
        .await;
    assert!(matches!(
        outcome.error,
        Some(DeployError::ApplicationNotFound(_))
    ));
    assert_eq!(h.store.deployment_count(), 0);
}

#[tokio::test]
async fn missing_compose_file_is_a_precondition_failure() {
    let h = Harness::builder().without_compose_file().build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    let err = outcome.error.unwrap();
    assert!(matches!(err, DeployError::ComposeFileMissing(_)));
    assert_eq!(err.kind(), DeployErrorKind::Precondition);
    assert_eq!(h.store.deployment_count(), 0);
    assert_eq!(app_status(&h).await, AppStatus::Stopped);
}

#[tokio::test]
async fn exposed_service_without_port_touches_nothing() {
    let h = Harness::builder()
        .routed("web", None, "shop.example.com", ExposureMethod::Dns)
        .build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    let err = outcome.error.unwrap();
    assert_eq!(err.kind(), DeployErrorKind::Precondition);
    assert!(err.to_string().contains("'web'"));
    assert_eq!(h.store.deployment_count(), 0);
    assert!(h.cluster.calls().is_empty());
    assert!(h.proxy.routes().is_empty());
    assert_eq!(app_status(&h).await, AppStatus::Stopped);
}

#[tokio::test]
async fn terminal_status_is_written_once() {
    let h = Harness::new();
    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    let deployment = outcome.deployment.unwrap();

    let again = h
        .store
        .finish_deployment(
            &deployment.id,
            DeploymentFinish {
                status: DeploymentStatus::Failed,
                build_log: String::new(),
                commit: None,
                error: Some("late".to_string()),
            },
        )
        .await;
    assert!(matches!(again, Err(StoreError::AlreadyFinished(_))));

    let stored = h.store.get_deployment(&deployment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Running);
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn late_subscriber_replays_the_whole_attempt() {
    let h = Harness::new();
    let (_live, mut rx) = h.service.progress().subscribe_channel(&h.app_id);

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    assert!(outcome.success);

    let mut live = Vec::new();
    while let Ok(event) = rx.try_recv() {
        live.push(event.message);
    }

    let (late, mut late_rx) = h.service.progress().subscribe_channel(&h.app_id);
    assert!(late.is_complete);
    assert_eq!(late.final_event.unwrap().stage, Stage::Done);
    let mut replayed = Vec::new();
    while let Ok(event) = late_rx.try_recv() {
        replayed.push(event.message);
    }

    assert_eq!(late.replayed, live.len());
    assert_eq!(replayed, live);
    assert_eq!(replayed.first().unwrap(), "Starting deployment of shop");
}

#[tokio::test]
async fn per_call_callback_sees_every_event_and_may_panic() {
    let h = Harness::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
        sink.lock().push(event.stage);
        if event.stage == Stage::Building {
            panic!("callback blew up");
        }
    });

    let outcome = h
        .service
        .deploy(&h.app_id, DeployedBy::Manual, Some(callback))
        .await;

    assert!(outcome.success);
    let seen = seen.lock();
    assert_eq!(seen.first(), Some(&Stage::Starting));
    assert_eq!(seen.last(), Some(&Stage::Done));
    assert_eq!(seen.len(), h.service.progress().events(&h.app_id).len());
}

#[tokio::test]
async fn cancel_during_build_stops_the_application() {
    let h = Harness::new();
    h.cluster.block_at(BlockAt::Build);

    let (outcome, cancelled) = tokio::join!(
        h.service.deploy(&h.app_id, DeployedBy::Manual, None),
        async {
            h.cluster.blocked.notified().await;
            let deployments = h.store.list_deployments(&h.app_id).await.unwrap();
            h.service.cancel(&deployments[0].id)
        }
    );

    assert!(cancelled);
    assert!(outcome.cancelled);
    assert!(!outcome.success);
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Cancelled);
    assert_eq!(deployment.error.as_deref(), Some("Deployment cancelled by user"));
    assert_eq!(app_status(&h).await, AppStatus::Stopped);

    assert!(!h.cluster.called("deploy_stack"));
    assert!(!h.cluster.called("wait_healthy"));
    assert!(!h.cluster.called("remove_stack"));
    assert!(!h.service.registry().is_active(&deployment.id));

    let last = h.service.progress().final_event(&h.app_id).unwrap();
    assert_eq!(last.stage, Stage::Cancelled);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn cancel_during_stack_deploy_removes_the_partial_stack() {
    let h = Harness::new();
    h.cluster.block_at(BlockAt::Deploy);

    let (outcome, _) = tokio::join!(
        h.service.deploy(&h.app_id, DeployedBy::Manual, None),
        async {
            h.cluster.blocked.notified().await;
            let deployments = h.store.list_deployments(&h.app_id).await.unwrap();
            h.service.cancel(&deployments[0].id)
        }
    );

    assert!(outcome.cancelled);
    assert!(h.cluster.called("remove_stack:shop"));
    assert!(!h.cluster.called("wait_healthy"));
    assert_eq!(app_status(&h).await, AppStatus::Stopped);
}

#[tokio::test]
async fn cancel_of_unknown_deployment_reports_nothing_running() {
    let h = Harness::new();
    assert!(!h.service.cancel(&DeploymentId::new("nope")));
}

#[tokio::test]
async fn concurrent_deploys_create_one_deployment() {
    let h = Harness::new();
    h.cluster.block_at(BlockAt::Build);

    let (first, second) = tokio::join!(
        h.service.deploy(&h.app_id, DeployedBy::Manual, None),
        async {
            h.cluster.blocked.notified().await;
            let second = h.service.deploy(&h.app_id, DeployedBy::Auto, None).await;
            h.cluster.release();
            second
        }
    );

    assert!(first.success, "first deploy failed: {:?}", first.error);
    assert!(matches!(second.error, Some(DeployError::AlreadyBuilding(_))));
    assert!(second.deployment.is_none());
    assert_eq!(h.store.deployment_count(), 1);
    assert_eq!(h.cluster.count("build:"), 1);
}

#[tokio::test]
async fn build_failure_is_recorded_on_the_deployment() {
    let h = Harness::new();
    h.cluster.fail_build("no space left on device");

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!outcome.success);
    assert!(!outcome.cancelled);
    let err = outcome.error.unwrap();
    assert_eq!(err.kind(), DeployErrorKind::Stage);
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error.unwrap().contains("no space left on device"));
    assert!(deployment.build_log.contains("Step 1/2"));
    assert_eq!(app_status(&h).await, AppStatus::Failed);
    assert!(!h.cluster.called("deploy_stack"));

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Failure);
    assert_eq!(
        h.service.progress().final_event(&h.app_id).unwrap().stage,
        Stage::Failed
    );
}

#[tokio::test]
async fn port_conflicts_fail_before_building() {
    let h = Harness::new();
    h.cluster.set_port_check(PortCheck {
        valid: false,
        conflicts: vec![PortConflict {
            service: "web".to_string(),
            port: 8080,
            env_var: None,
        }],
        allocations: Vec::new(),
    });

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(matches!(outcome.error, Some(DeployError::PortConflict(_))));
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error.unwrap().contains("8080"));
    assert!(!h.cluster.called("build:"));
    assert_eq!(app_status(&h).await, AppStatus::Failed);
}

#[tokio::test]
async fn reassigned_ports_are_persisted_into_the_environment() {
    let h = Harness::new();
    h.cluster.set_port_check(PortCheck {
        valid: true,
        conflicts: Vec::new(),
        allocations: vec![PortAllocation {
            service: "web".to_string(),
            env_var: "WEB_PORT".to_string(),
            from: 8080,
            to: 10001,
        }],
    });

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    assert!(outcome.success);

    let app = h.store.get_application(&h.app_id).await.unwrap().unwrap();
    assert_eq!(app.env.get("WEB_PORT").map(String::as_str), Some("10001"));
    assert!(
        h.service
            .progress()
            .events(&h.app_id)
            .iter()
            .any(|e| e.stage == Stage::Ports && e.message.contains("WEB_PORT=10001"))
    );
}

#[tokio::test]
async fn health_timeout_is_a_warning() {
    let h = Harness::new();
    h.cluster.set_unhealthy(&["worker"]);

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(outcome.success);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::HealthTimeout)
    );
    let last = h.service.progress().final_event(&h.app_id).unwrap();
    assert_eq!(last.stage, Stage::Done);
    assert!(last.message.contains("still starting: worker"));
}

#[tokio::test]
async fn dns_exposure_without_credential_needs_manual_record() {
    let h = Harness::builder()
        .dns(FakeDns::unconfigured())
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::ManualDns && w.message.contains("shop.example.com"))
    );
    assert!(h.dns.records().is_empty());
    let routes = h.proxy.routes();
    assert_eq!(routes.len(), 1);
    assert!(!routes[0].has_certificate);
    let services = h.store.list_services(&h.app_id).await.unwrap();
    assert_eq!(services[0].status, ServiceStatus::Running);
}

#[tokio::test]
async fn missing_proxy_is_started_once() {
    let h = Harness::builder()
        .proxy(FakeProxy::default())
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();

    let first = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    let second = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(first.success);
    assert!(second.success);
    assert_eq!(h.proxy.starts(), 1);
}

#[tokio::test]
async fn tunnel_exposure_without_credential_fails_before_deploy() {
    let h = Harness::builder()
        .dns(FakeDns::new(true, false))
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Tunnel)
        .build();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!outcome.success);
    let err = outcome.error.unwrap();
    assert!(err.to_string().contains("tunnel"));
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(app_status(&h).await, AppStatus::Failed);
    assert!(!h.cluster.called("build:"));
    assert!(!h.cluster.called("deploy_stack"));
    assert!(h.dns.tunnels().is_empty());
}

#[tokio::test]
async fn tunnel_exposure_creates_tunnel_and_agent() {
    let h = Harness::builder()
        .routed("web", Some(3000), "shop.example.com", ExposureMethod::Tunnel)
        .build();
    h.cluster
        .set_statuses(vec![running("web"), running("tunnel-agent")]);

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);

    assert_eq!(h.dns.tunnels(), vec!["dockyard-shop-node1"]);
    let ingress = h.dns.ingress();
    assert_eq!(ingress.len(), 1);
    let rules = &ingress[0].1;
    assert_eq!(rules[0].hostname.as_deref(), Some("shop.example.com"));
    assert_eq!(rules[0].service, "http://shop_web:3000");
    assert_eq!(rules.last().unwrap().service, CATCH_ALL_SERVICE);
    assert_eq!(h.dns.cnames().len(), 1);
    assert!(h.proxy.routes().is_empty());

    let agents = h.cluster.agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(
        agents[0].environment.get("TUNNEL_TOKEN").map(String::as_str),
        Some("token-1")
    );
    assert_eq!(h.cluster.count("deploy_stack:shop"), 2);

    let tunnel = h.store.get_tunnel(&h.app_id).await.unwrap().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);

    let services = h.store.list_services(&h.app_id).await.unwrap();
    assert!(services.iter().all(|s| s.service_name != "tunnel-agent"));
}

#[tokio::test]
async fn redeploy_reuses_the_existing_tunnel() {
    let h = Harness::builder()
        .routed("web", Some(3000), "shop.example.com", ExposureMethod::Tunnel)
        .build();

    assert!(h.service.deploy(&h.app_id, DeployedBy::Manual, None).await.success);
    assert!(h.service.deploy(&h.app_id, DeployedBy::Auto, None).await.success);

    assert_eq!(h.dns.tunnels().len(), 1);
    assert_eq!(h.dns.ingress().len(), 2);
}

#[tokio::test]
async fn certificate_failure_falls_back_to_proxy_tls() {
    let h = Harness::builder()
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();
    h.dns.fail_certificates();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    let fallback = outcome
        .warnings
        .iter()
        .find(|w| w.kind == WarningKind::CertificateFallback)
        .unwrap();
    assert!(fallback.message.contains("example.com"));
    assert!(fallback.message.contains("permission"));
    let routes = h.proxy.routes();
    assert_eq!(routes.len(), 1);
    assert!(!routes[0].has_certificate);
    assert_eq!(h.dns.records().len(), 1);
}

#[tokio::test]
async fn unknown_public_ip_fails_the_deployment() {
    let h = Harness::builder()
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();
    h.dns.hide_public_ip();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!outcome.success);
    let err = outcome.error.unwrap();
    assert_eq!(err.kind(), DeployErrorKind::Stage);
    assert!(err.to_string().contains("public IP"));
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error.unwrap().contains("public IP"));
    assert!(h.dns.records().is_empty());
    assert_eq!(app_status(&h).await, AppStatus::Failed);
}

#[tokio::test]
async fn record_creation_failure_fails_the_deployment() {
    let h = Harness::builder()
        .routed("web", Some(80), "shop.example.com", ExposureMethod::Dns)
        .build();
    h.dns.fail_records();

    let outcome = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!outcome.success);
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error.unwrap().contains("record quota exceeded"));
    assert_eq!(
        h.service.progress().final_event(&h.app_id).unwrap().stage,
        Stage::Failed
    );
}

#[tokio::test]
async fn disabled_notifications_are_not_sent() {
    let h = Harness::builder().without_notifications().build();

    assert!(h.service.deploy(&h.app_id, DeployedBy::Manual, None).await.success);
    h.cluster.fail_build("exit status 1");
    let failed = h.service.deploy(&h.app_id, DeployedBy::Manual, None).await;

    assert!(!failed.success);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn cancel_while_waiting_for_a_started_proxy() {
    let h = Harness::builder().proxy(FakeProxy::never_ready()).build();
    let started = Instant::now();

    let (outcome, _) = tokio::join!(
        h.service.deploy(&h.app_id, DeployedBy::Manual, None),
        async {
            h.proxy.started.notified().await;
            let deployments = h.store.list_deployments(&h.app_id).await.unwrap();
            h.service.cancel(&deployments[0].id)
        }
    );

    assert!(outcome.cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.proxy.starts(), 1);
    assert!(!h.cluster.called("build:"));
    assert_eq!(app_status(&h).await, AppStatus::Stopped);
}

fn git(dir: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.name=Dockyard Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn recorded_commit_is_the_one_checked_out_before_building() {
    let h = Harness::new();
    if !git(h.dir.path(), &["init", "-q"]) {
        return;
    }
    assert!(git(h.dir.path(), &["add", "."]));
    assert!(git(h.dir.path(), &["commit", "-q", "-m", "Initial"]));
    h.cluster.block_at(BlockAt::Build);

    let (outcome, _) = tokio::join!(
        h.service.deploy(&h.app_id, DeployedBy::Manual, None),
        async {
            h.cluster.blocked.notified().await;
            std::fs::write(h.dir.path().join("README"), "moved on").unwrap();
            assert!(git(h.dir.path(), &["add", "."]));
            assert!(git(h.dir.path(), &["commit", "-q", "-m", "Later"]));
            h.cluster.release();
        }
    );

    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    let deployment = outcome.deployment.unwrap();
    assert_eq!(deployment.commit_message.as_deref(), Some("Initial"));
    let app = h.store.get_application(&h.app_id).await.unwrap().unwrap();
    assert_eq!(app.last_commit_message.as_deref(), Some("Initial"));
}
