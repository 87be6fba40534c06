//! Metrics feed following an application through deployments.


use std::time::Duration;

use futures_util::StreamExt;
use harness::Harness;
use quark_deployer::{MetricEvent, MetricsCollector, MetricsConfig, MetricsSubscription, Resources};

fn collector(h: &Harness) -> MetricsCollector {
    MetricsCollector::new(h.runtime.clone(), h.router.clone(), MetricsConfig::default())
}

/// Next event that is a sample, counting gaps skipped on the way.
async fn next_sample(feed: &mut MetricsSubscription) -> (String, usize) {
    let mut gaps = 0;
    loop {
        match feed.next().await.expect("feed open") {
            MetricEvent::Sample(sample) => return (sample.container, gaps),
            MetricEvent::Gap { .. } => gaps += 1,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_feed_follows_cutover() {
    let h = Harness::new(Duration::from_secs(10));
    let app = h.register("web", Resources::new(0.5, 256)).await;
    let metrics = collector(&h);
    let mut feed = metrics.subscribe(app);

    let first = feed.next().await.unwrap();
    assert!(matches!(
        &first,
        MetricEvent::Gap { reason, .. } if reason == "no active container"
    ));
    assert_eq!(first.application_id(), app);

    let v1 = h.deploy_to_end(app, "v1").await.candidate.unwrap();
    let (container, _) = next_sample(&mut feed).await;
    assert_eq!(container, v1.name());

    let v2 = h.deploy_to_end(app, "v2").await.candidate.unwrap();

    // Once v1 is serving, every reading is a sample: the route moves before
    // the old container stops.
    loop {
        let (container, gaps) = next_sample(&mut feed).await;
        assert_eq!(gaps, 0);
        if container == v2.name() {
            break;
        }
        assert_eq!(container, v1.name());
    }
}

#[tokio::test(start_paused = true)]
async fn test_feed_reports_gap_and_recovers() {
    let h = Harness::new(Duration::from_secs(10));
    let app = h.register("web", Resources::new(0.5, 256)).await;
    let active = h.deploy_to_end(app, "v1").await.candidate.unwrap();

    let metrics = collector(&h);
    h.runtime.fail_next_stats(2);
    let mut feed = metrics.subscribe(app);

    assert!(feed.next().await.unwrap().is_gap());
    assert!(feed.next().await.unwrap().is_gap());
    let (container, gaps) = next_sample(&mut feed).await;
    assert_eq!(gaps, 0);
    assert_eq!(container, active.name());
}

#[tokio::test(start_paused = true)]
async fn test_sampler_stops_with_last_subscriber_and_restarts() {
    let h = Harness::new(Duration::from_secs(10));
    let app = h.register("web", Resources::new(0.5, 256)).await;
    let active = h.deploy_to_end(app, "v1").await.candidate.unwrap();
    let metrics = collector(&h);

    let mut a = metrics.subscribe(app);
    let b = metrics.subscribe(app);
    assert_eq!(metrics.subscriber_count(app), 2);
    a.next().await.unwrap();

    drop(a);
    drop(b);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!metrics.is_sampling(app));

    let mut again = metrics.subscribe(app);
    assert!(metrics.is_sampling(app));
    let (container, _) = next_sample(&mut again).await;
    assert_eq!(container, active.name());
}
