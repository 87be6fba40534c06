//! Container runtime interface.
//!
//! The runtime builds images and owns container lifecycle:
//! - Building an image for an application version
//! - Starting a container with CPU/memory limits
//! - Inspecting liveness and reading resource usage
//! - Stopping and removing containers
//!
//! `DockerRuntime` talks to the Docker Engine; `MockRuntime` is an in-memory
//! double for tests and development.

mod docker;
mod mock;

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use quark_id::{ApplicationId, DeploymentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::model::Resources;

pub use docker::{DockerConfig, DockerRuntime};
pub use mock::MockRuntime;

/// Opaque reference to a container owned by the runtime.
///
/// Callers pass handles between the runtime, prober and router without
/// looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    id: String,
    name: String,
    #[serde(default)]
    endpoint: Option<String>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoint: None,
        }
    }

    /// Handle addressing a container by name only, before its id is known.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name)
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port` the container serves on, once known.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub application_id: ApplicationId,
    pub repo_url: String,
    pub branch: String,
    pub version: String,
}

/// What to start.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub application_id: ApplicationId,
    pub deployment_id: DeploymentId,
    /// Container name; unique per deployment so blue and green can coexist.
    pub name: String,
    pub image: String,
    pub resources: Resources,
    pub env: BTreeMap<String, String>,
}

impl StartSpec {
    /// Container name used for a deployment's candidate.
    pub fn container_name(application_id: ApplicationId, deployment_id: DeploymentId) -> String {
        format!("quark-{}-{}", application_id.short(), deployment_id.short())
    }
}

/// Engine-level healthcheck state, when the image defines one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    /// Image has no healthcheck.
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub health: HealthState,
    pub endpoint: Option<String>,
}

impl ContainerStatus {
    /// Running, and not reported unhealthy or still starting by the engine.
    pub fn is_ready(&self) -> bool {
        self.running && matches!(self.health, HealthState::None | HealthState::Healthy)
    }
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    /// Worth retrying: connection trouble or an engine-side 5xx.
    #[error("transient runtime error: {0}")]
    Transient(String),

    #[error("runtime error: {0}")]
    Permanent(String),

    #[error("image build failed: {0}")]
    Build(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image for the given version and return its tag.
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, RuntimeError>;

    /// Create and start a container.
    async fn start_container(&self, spec: &StartSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Read liveness of a container.
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError>;

    /// Stop and remove a container. A container that no longer exists counts
    /// as removed.
    async fn stop_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Read current resource usage.
    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError>;
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only `RuntimeError::Transient` is retried.
pub async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Runtime call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
            jitter: 0.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RuntimeError::Transient("socket reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Transient("engine 503".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Permanent("bad request".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_container_name_is_unique_per_deployment() {
        let app = ApplicationId::new();
        let a = StartSpec::container_name(app, DeploymentId::new());
        std::thread::sleep(Duration::from_millis(2));
        let b = StartSpec::container_name(app, DeploymentId::new());
        assert!(a.starts_with(&format!("quark-{}-", app.short())));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ready_requires_running_and_not_unhealthy() {
        let status = |running, health| ContainerStatus {
            running,
            health,
            endpoint: None,
        };
        assert!(status(true, HealthState::None).is_ready());
        assert!(status(true, HealthState::Healthy).is_ready());
        assert!(!status(true, HealthState::Starting).is_ready());
        assert!(!status(true, HealthState::Unhealthy).is_ready());
        assert!(!status(false, HealthState::Healthy).is_ready());
    }
}
