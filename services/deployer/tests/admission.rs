//! Admission control against the host resource ceiling.


use std::time::Duration;

use harness::Harness;
use proptest::prelude::*;
use quark_deployer::{DeployError, DeploymentRequest, DeploymentState, Outcome, Resources, TrafficRouter};

const GRACE: Duration = Duration::from_secs(10);

fn two_cpus() -> Resources {
    Resources::new(2.0, 4096)
}

#[tokio::test(start_paused = true)]
async fn test_denied_application_does_not_disturb_running_one() {
    let h = Harness::with_ceiling(two_cpus(), GRACE);
    let a = h.register("a", Resources::new(1.5, 512)).await;
    let b = h.register("b", Resources::new(1.0, 512)).await;

    let a_done = h.deploy_to_end(a, "v1").await;
    assert_eq!(a_done.state, DeploymentState::Succeeded);

    let err = h
        .orchestrator
        .deploy(DeploymentRequest::new(b, "v1"))
        .await
        .unwrap_err();
    let DeployError::AdmissionDenied { deployment_id, .. } = err else {
        panic!("expected admission denial, got {err:?}");
    };

    let denied = h.orchestrator.get_status(deployment_id).await.unwrap();
    assert_eq!(denied.state, DeploymentState::AdmissionDenied);
    assert_eq!(denied.outcome, Some(Outcome::Failed));
    assert!(denied.failure.unwrap().contains("admission denied"));
    assert_eq!(h.runtime.build_count(), 1);

    assert_eq!(h.router.current_target(a), a_done.candidate);
    assert!(h.runtime.is_running(a_done.candidate.as_ref().unwrap()));
    assert_eq!(h.ledger.usage().cpu_millicores, 1500);
    assert_eq!(h.orchestrator.list_deployments(b).await.unwrap().len(), 1);

    // A denial does not hold the application's lease.
    let retry = h.orchestrator.deploy(DeploymentRequest::new(b, "v1")).await;
    assert!(matches!(retry, Err(DeployError::AdmissionDenied { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_redeploy_needs_room_for_both_versions() {
    let h = Harness::with_ceiling(two_cpus(), GRACE);
    let app = h.register("big", Resources::new(1.5, 512)).await;
    h.deploy_to_end(app, "v1").await;

    let err = h
        .orchestrator
        .deploy(DeploymentRequest::new(app, "v2"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AdmissionDenied { .. }));

    // A smaller candidate fits next to the running version.
    let id = h
        .orchestrator
        .deploy(DeploymentRequest::new(app, "v2").with_resources(Resources::new(0.5, 512)))
        .await
        .unwrap();
    let done = h.orchestrator.wait_for_terminal(id).await.unwrap();
    assert_eq!(done.state, DeploymentState::Succeeded);
    assert_eq!(h.ledger.usage().cpu_millicores, 500);
}

#[tokio::test(start_paused = true)]
async fn test_retiring_container_holds_capacity_until_stopped() {
    let h = Harness::with_ceiling(two_cpus(), GRACE);
    let app = h.register("web", Resources::new(0.8, 256)).await;
    let other = h.register("worker", Resources::new(0.5, 256)).await;
    h.deploy_to_end(app, "v1").await;

    let id = h.deploy(app, "v2").await;
    h.wait_for_state(id, DeploymentState::Retiring).await;
    assert_eq!(h.ledger.usage().cpu_millicores, 1600);

    let err = h
        .orchestrator
        .deploy(DeploymentRequest::new(other, "v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AdmissionDenied { .. }));

    h.orchestrator.wait_for_terminal(id).await.unwrap();
    assert_eq!(h.ledger.usage().cpu_millicores, 800);

    let worker = h.deploy_to_end(other, "v1").await;
    assert_eq!(worker.state, DeploymentState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_memory_ceiling_applies_independently() {
    let h = Harness::with_ceiling(Resources::new(4.0, 1024), GRACE);
    let a = h.register("a", Resources::new(0.5, 768)).await;
    let b = h.register("b", Resources::new(0.5, 512)).await;

    h.deploy_to_end(a, "v1").await;
    let err = h
        .orchestrator
        .deploy(DeploymentRequest::new(b, "v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AdmissionDenied { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_is_rejected_before_admission() {
    let h = Harness::with_ceiling(two_cpus(), GRACE);
    let app = h.register("web", Resources::new(0.5, 256)).await;

    let err = h
        .orchestrator
        .deploy(DeploymentRequest::new(app, "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::InvalidRequest(_)));
    assert!(h.orchestrator.list_deployments(app).await.unwrap().is_empty());
    assert_eq!(h.ledger.usage().cpu_millicores, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Overlapping first deployments are admitted greedily in request order
    /// and never commit more than the ceiling.
    #[test]
    fn prop_overlapping_admissions_respect_ceiling(tenths in prop::collection::vec(1u64..=20, 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let h = Harness::with_ceiling(Resources::new(2.0, 1 << 20), Duration::ZERO);
            h.runtime.set_build_delay(Duration::from_secs(5));

            let mut admitted = Vec::new();
            let mut expected_millicores = 0;
            for (i, cpu) in tenths.iter().enumerate() {
                let app = h
                    .register(&format!("app-{i}"), Resources::new(*cpu as f64 / 10.0, 64))
                    .await;
                let fits = expected_millicores + cpu * 100 <= 2000;

                match h.orchestrator.deploy(DeploymentRequest::new(app, "v1")).await {
                    Ok(id) => {
                        assert!(fits, "admitted {cpu} tenths over the ceiling");
                        expected_millicores += cpu * 100;
                        admitted.push(id);
                    }
                    Err(DeployError::AdmissionDenied { .. }) => assert!(!fits),
                    Err(e) => panic!("unexpected error: {e}"),
                }
                assert!(h.ledger.usage().cpu_millicores <= 2000);
            }

            for id in admitted {
                let done = h.orchestrator.wait_for_terminal(id).await.unwrap();
                assert_eq!(done.state, DeploymentState::Succeeded);
            }
            let usage = h.ledger.usage();
            assert_eq!(usage.cpu_millicores, expected_millicores);
            assert_eq!(usage.provisional, 0);
        });
    }
}
