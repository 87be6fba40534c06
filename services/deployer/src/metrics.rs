//! Live resource metrics per application.
//!
//! Subscribing to an application starts a sampler that reads the stats of
//! whichever container the router currently sends its traffic to, once per
//! interval, and broadcasts the result to every subscriber. A failed read is
//! published as a gap and sampling carries on. The sampler exits once the
//! last subscriber has gone; subscribing again starts a fresh one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use quark_id::ApplicationId;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument};

use crate::router::TrafficRouter;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerStats, RuntimeError};

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub interval: Duration,
    /// Events buffered per feed before slow subscribers start skipping.
    pub channel_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub application_id: ApplicationId,
    pub container: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_in_bytes: u64,
    pub network_out_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    Sample(MetricSample),
    /// No reading this interval.
    Gap {
        application_id: ApplicationId,
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

impl MetricEvent {
    pub fn application_id(&self) -> ApplicationId {
        match self {
            Self::Sample(s) => s.application_id,
            Self::Gap { application_id, .. } => *application_id,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

struct Feed {
    tx: broadcast::Sender<MetricEvent>,
}

struct Inner {
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<dyn TrafficRouter>,
    config: MetricsConfig,
    feeds: Mutex<HashMap<ApplicationId, Feed>>,
}

impl Inner {
    fn feeds(&self) -> MutexGuard<'_, HashMap<ApplicationId, Feed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read(&self, application_id: ApplicationId) -> MetricEvent {
        let gap = |reason: String| MetricEvent::Gap {
            application_id,
            timestamp: Utc::now(),
            reason,
        };

        let Some(container) = self.router.current_target(application_id) else {
            return gap("no active container".to_string());
        };

        let stats = tokio::time::timeout(self.config.interval, self.runtime.stats(&container));
        match stats.await {
            Ok(Ok(stats)) => MetricEvent::Sample(MetricSample {
                application_id,
                container: container.name().to_string(),
                timestamp: Utc::now(),
                cpu_percent: stats.cpu_percent,
                memory_mb: stats.memory_mb,
                network_in_bytes: stats.network_rx_bytes,
                network_out_bytes: stats.network_tx_bytes,
            }),
            Ok(Err(e)) => gap(e.to_string()),
            Err(_) => gap("stats read timed out".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

impl MetricsCollector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn TrafficRouter>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                router,
                config,
                feeds: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// One-off reading of a container.
    pub async fn sample(&self, container: &ContainerHandle) -> Result<ContainerStats, RuntimeError> {
        self.inner.runtime.stats(container).await
    }

    /// Attach to an application's feed, starting its sampler if needed.
    pub fn subscribe(&self, application_id: ApplicationId) -> MetricsSubscription {
        let mut feeds = self.inner.feeds();
        if let Some(feed) = feeds.get(&application_id) {
            return MetricsSubscription::new(feed.tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(self.inner.config.channel_capacity.max(1));
        feeds.insert(application_id, Feed { tx: tx.clone() });
        tokio::spawn(run_sampler(Arc::clone(&self.inner), application_id, tx));

        info!(application_id = %application_id, "Metrics sampler started");
        MetricsSubscription::new(rx)
    }

    pub fn subscriber_count(&self, application_id: ApplicationId) -> usize {
        self.inner
            .feeds()
            .get(&application_id)
            .map_or(0, |f| f.tx.receiver_count())
    }

    /// Whether a sampler is running for the application.
    pub fn is_sampling(&self, application_id: ApplicationId) -> bool {
        self.inner.feeds().contains_key(&application_id)
    }
}

#[instrument(skip_all, fields(application_id = %application_id))]
async fn run_sampler(
    inner: Arc<Inner>,
    application_id: ApplicationId,
    tx: broadcast::Sender<MetricEvent>,
) {
    let mut ticker = tokio::time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        {
            // Checked under the feeds lock so a concurrent subscribe either
            // joins this feed before the check or starts a new one after it.
            let mut feeds = inner.feeds();
            if tx.receiver_count() == 0 {
                feeds.remove(&application_id);
                info!("Metrics sampler stopped, no subscribers");
                return;
            }
        }

        let event = inner.read(application_id).await;
        if let MetricEvent::Gap { reason, .. } = &event {
            debug!(reason = %reason, "Metrics gap");
        }
        // All receivers may have dropped since the check; the next tick
        // notices.
        let _ = tx.send(event);
    }
}

/// Stream of metric events for one application.
///
/// Slow consumers skip events they fell behind on rather than erroring.
pub struct MetricsSubscription {
    inner: BroadcastStream<MetricEvent>,
}

impl MetricsSubscription {
    fn new(rx: broadcast::Receiver<MetricEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
        }
    }
}

impl Stream for MetricsSubscription {
    type Item = MetricEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(event)) => return Poll::Ready(Some(event)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    debug!(skipped, "Metrics subscriber lagged");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;
    use crate::router::MockRouter;
    use crate::runtime::{MockRuntime, StartSpec};
    use futures_util::StreamExt;
    use quark_id::DeploymentId;

    struct Fixture {
        runtime: Arc<MockRuntime>,
        router: Arc<MockRouter>,
        collector: MetricsCollector,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MockRuntime::new());
        let router = Arc::new(MockRouter::new());
        let collector =
            MetricsCollector::new(runtime.clone(), router.clone(), MetricsConfig::default());
        Fixture {
            runtime,
            router,
            collector,
        }
    }

    async fn deploy(f: &Fixture, app: ApplicationId) -> ContainerHandle {
        let dep = DeploymentId::new();
        let handle = f
            .runtime
            .start_container(&StartSpec {
                application_id: app,
                deployment_id: dep,
                name: StartSpec::container_name(app, dep),
                image: "img".into(),
                resources: Resources::default(),
                env: Default::default(),
            })
            .await
            .unwrap();
        f.router.switch_target(app, &handle).await.unwrap();
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_active_container() {
        let f = fixture();
        let app = ApplicationId::new();
        let handle = deploy(&f, app).await;

        let mut feed = f.collector.subscribe(app);
        match feed.next().await.unwrap() {
            MetricEvent::Sample(s) => {
                assert_eq!(s.application_id, app);
                assert_eq!(s.container, handle.name());
                assert_eq!(s.network_in_bytes, 1024);
            }
            gap => panic!("expected sample, got {gap:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_is_a_gap_and_sampling_continues() {
        let f = fixture();
        let app = ApplicationId::new();
        deploy(&f, app).await;
        f.runtime.fail_next_stats(1);

        let mut feed = f.collector.subscribe(app);
        assert!(feed.next().await.unwrap().is_gap());
        assert!(!feed.next().await.unwrap().is_gap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_active_container_is_a_gap() {
        let f = fixture();
        let mut feed = f.collector.subscribe(ApplicationId::new());
        let event = feed.next().await.unwrap();
        assert!(matches!(event, MetricEvent::Gap { ref reason, .. } if reason == "no active container"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_app_does_not_stop_another() {
        let f = fixture();
        let healthy = ApplicationId::new();
        let broken = ApplicationId::new();
        deploy(&f, healthy).await;
        f.router
            .switch_target(broken, &ContainerHandle::named("vanished"))
            .await
            .unwrap();

        let mut good = f.collector.subscribe(healthy);
        let mut bad = f.collector.subscribe(broken);
        for _ in 0..3 {
            assert!(!good.next().await.unwrap().is_gap());
            assert!(bad.next().await.unwrap().is_gap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_stops_without_subscribers_and_restarts() {
        let f = fixture();
        let app = ApplicationId::new();
        deploy(&f, app).await;

        let mut a = f.collector.subscribe(app);
        let b = f.collector.subscribe(app);
        assert_eq!(f.collector.subscriber_count(app), 2);
        a.next().await.unwrap();

        drop(a);
        drop(b);
        assert_eq!(f.collector.subscriber_count(app), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.collector.is_sampling(app));

        let mut again = f.collector.subscribe(app);
        assert!(f.collector.is_sampling(app));
        assert!(!again.next().await.unwrap().is_gap());
    }
}
