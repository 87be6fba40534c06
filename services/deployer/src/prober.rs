//! Candidate health probing.
//!
//! A probe round asks the runtime whether the container is running (and, if
//! the image defines one, whether the engine healthcheck passes). When an
//! HTTP path is configured the container must also answer it with a 2xx.
//! Individual failures are only logged; the caller sees `Healthy` or
//! `Timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::backoff::BackoffPolicy;
use crate::runtime::{ContainerHandle, ContainerRuntime};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Base delay between probe rounds.
    pub interval: Duration,
    /// Jitter factor applied to each delay.
    pub jitter: f64,
    /// Optional application-level check, e.g. `/health`.
    pub http_path: Option<String>,
    /// Bound on a single HTTP check.
    pub http_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            jitter: 0.25,
            http_path: None,
            http_timeout: Duration::from_secs(2),
        }
    }
}

impl ProbeConfig {
    /// Delays grow from `interval` up to four times it.
    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.interval,
            max: self.interval * 4,
            jitter: self.jitter,
            max_attempts: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { attempts: u32, elapsed: Duration },
    Timeout { attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Poll until the container is ready or `deadline` has elapsed.
    async fn wait_until_healthy(&self, container: &ContainerHandle, deadline: Duration)
        -> ProbeOutcome;
}

/// Prober backed by runtime inspection, plus an optional HTTP check.
pub struct RuntimeProber {
    runtime: Arc<dyn ContainerRuntime>,
    config: ProbeConfig,
    http: reqwest::Client,
}

impl RuntimeProber {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ProbeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            runtime,
            config,
            http,
        }
    }

    /// One probe round. Returns the reason when not ready.
    async fn probe(&self, container: &ContainerHandle) -> Result<(), String> {
        let status = self
            .runtime
            .inspect(container)
            .await
            .map_err(|e| e.to_string())?;
        if !status.is_ready() {
            return Err(format!(
                "running={} health={:?}",
                status.running, status.health
            ));
        }

        let Some(path) = &self.config.http_path else {
            return Ok(());
        };
        let endpoint = status
            .endpoint
            .as_deref()
            .or(container.endpoint())
            .ok_or("no endpoint for http check")?;

        let url = format!("http://{endpoint}{path}");
        let response = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("{url} returned {}", response.status()))
        }
    }
}

#[async_trait]
impl HealthProber for RuntimeProber {
    #[instrument(skip(self, container), fields(container = %container))]
    async fn wait_until_healthy(
        &self,
        container: &ContainerHandle,
        deadline: Duration,
    ) -> ProbeOutcome {
        let started = Instant::now();
        let give_up = started + deadline;
        let backoff = self.config.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let round = tokio::time::timeout_at(give_up, self.probe(container)).await;
            match round {
                Ok(Ok(())) => {
                    return ProbeOutcome::Healthy {
                        attempts,
                        elapsed: started.elapsed(),
                    }
                }
                Ok(Err(reason)) => debug!(attempt = attempts, reason = %reason, "Probe not ready"),
                Err(_) => return ProbeOutcome::Timeout { attempts },
            }

            let now = Instant::now();
            if now >= give_up {
                return ProbeOutcome::Timeout { attempts };
            }
            let delay = backoff.delay(attempts - 1);
            tokio::time::sleep_until((now + delay).min(give_up)).await;
            if Instant::now() >= give_up {
                return ProbeOutcome::Timeout { attempts };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;
    use crate::runtime::{MockRuntime, StartSpec};
    use quark_id::{ApplicationId, DeploymentId};

    async fn started(runtime: &MockRuntime) -> ContainerHandle {
        let app = ApplicationId::new();
        let dep = DeploymentId::new();
        runtime
            .start_container(&StartSpec {
                application_id: app,
                deployment_id: dep,
                name: StartSpec::container_name(app, dep),
                image: "img".into(),
                resources: Resources::default(),
                env: Default::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_on_first_round() {
        let runtime = Arc::new(MockRuntime::new());
        let handle = started(&runtime).await;
        let prober = RuntimeProber::new(runtime, ProbeConfig::default());

        let outcome = prober
            .wait_until_healthy(&handle, Duration::from_secs(30))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Healthy { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_times_out_at_deadline() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_start_healthy(false);
        let handle = started(&runtime).await;
        let prober = RuntimeProber::new(runtime, ProbeConfig::default());

        let begun = Instant::now();
        let outcome = prober
            .wait_until_healthy(&handle, Duration::from_secs(30))
            .await;

        assert!(!outcome.is_healthy());
        assert!(matches!(outcome, ProbeOutcome::Timeout { attempts } if attempts > 5));
        assert_eq!(begun.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_healthy_later() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_start_healthy(false);
        let handle = started(&runtime).await;
        let prober = RuntimeProber::new(runtime.clone(), ProbeConfig::default());

        let flip = {
            let runtime = runtime.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                runtime.set_healthy(&handle, true);
            })
        };

        let outcome = prober
            .wait_until_healthy(&handle, Duration::from_secs(30))
            .await;
        flip.await.unwrap();

        match outcome {
            ProbeOutcome::Healthy { attempts, elapsed } => {
                assert!(attempts > 1);
                assert!(elapsed >= Duration::from_secs(5));
                assert!(elapsed < Duration::from_secs(10));
            }
            other => panic!("expected healthy, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_container_is_not_fatal() {
        let runtime = Arc::new(MockRuntime::new());
        let prober = RuntimeProber::new(runtime, ProbeConfig::default());

        let outcome = prober
            .wait_until_healthy(&ContainerHandle::named("gone"), Duration::from_secs(3))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Timeout { .. }));
    }
}
