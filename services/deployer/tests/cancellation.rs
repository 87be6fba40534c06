//! Cancelling deployments before and after traffic moves.


use std::time::Duration;

use harness::Harness;
use quark_deployer::{DeployError, DeploymentState, Outcome, Resources, TrafficRouter};
use quark_id::DeploymentId;
use tokio::time::Instant;

const GRACE: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_cancel_during_build() {
    let h = Harness::new(GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;

    h.runtime.set_build_delay(Duration::from_secs(60));
    let id = h.deploy(app, "v1").await;
    h.wait_for_state(id, DeploymentState::Building).await;

    let started = Instant::now();
    let cancelled = h.orchestrator.cancel(id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));

    assert_eq!(cancelled.state, DeploymentState::Cancelled);
    assert_eq!(cancelled.outcome, Some(Outcome::Cancelled));
    assert!(cancelled.failure.unwrap().contains("build"));
    assert_eq!(h.runtime.started_count(), 0);
    assert_eq!(h.ledger.usage().cpu_millicores, 0);
    assert!(h.router.current_target(app).is_none());

    let application = h.orchestrator.application(app).await.unwrap();
    assert!(application.active_container.is_none());

    // The stored record agrees with what cancel returned.
    let stored = h.orchestrator.get_status(id).await.unwrap();
    assert_eq!(stored.state, DeploymentState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_probe_stops_candidate() {
    let h = Harness::new(GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;
    let v1 = h.deploy_to_end(app, "v1").await.candidate.unwrap();

    h.runtime.set_start_healthy(false);
    let id = h.deploy(app, "v2").await;
    let probing = h.wait_for_state(id, DeploymentState::Probing).await;
    let candidate = probing.candidate.unwrap();
    assert!(h.runtime.is_running(&candidate));

    let cancelled = h.orchestrator.cancel(id).await.unwrap();
    assert_eq!(cancelled.state, DeploymentState::Cancelled);

    assert!(!h.runtime.is_running(&candidate));
    assert_eq!(h.router.current_target(app), Some(v1.clone()));
    assert_eq!(h.runtime.running_for(app), vec![v1]);

    let usage = h.ledger.usage();
    assert_eq!(usage.cpu_millicores, 500);
    assert_eq!(usage.provisional, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_cutover_is_refused() {
    let h = Harness::new(GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;
    h.deploy_to_end(app, "v1").await;

    let id = h.deploy(app, "v2").await;
    h.wait_for_state(id, DeploymentState::Retiring).await;

    let err = h.orchestrator.cancel(id).await.unwrap_err();
    assert!(matches!(
        err,
        DeployError::NotCancellable {
            state: DeploymentState::Retiring,
            ..
        }
    ));

    let done = h.orchestrator.wait_for_terminal(id).await.unwrap();
    assert_eq!(done.state, DeploymentState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_finished_deployment_is_refused() {
    let h = Harness::new(GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;
    let done = h.deploy_to_end(app, "v1").await;

    let err = h.orchestrator.cancel(done.id).await.unwrap_err();
    assert!(matches!(
        err,
        DeployError::NotCancellable {
            state: DeploymentState::Succeeded,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_unknown_deployment() {
    let h = Harness::new(GRACE);
    let err = h.orchestrator.cancel(DeploymentId::new()).await.unwrap_err();
    assert!(matches!(err, DeployError::UnknownDeployment(_)));
}

#[tokio::test(start_paused = true)]
async fn test_application_is_free_right_after_cancel() {
    let h = Harness::new(GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;

    h.runtime.set_build_delay(Duration::from_secs(60));
    let id = h.deploy(app, "v1").await;
    h.wait_for_state(id, DeploymentState::Building).await;
    h.orchestrator.cancel(id).await.unwrap();

    h.runtime.set_build_delay(Duration::ZERO);
    let next = h.deploy_to_end(app, "v1").await;
    assert_eq!(next.state, DeploymentState::Succeeded);
    assert!(next.previous.is_none());
}
