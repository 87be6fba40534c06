//! In-memory runtime for tests and development.
//!
//! Failures are scripted through setters so tests can drive every failure
//! path of a deployment without a container engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use quark_id::ApplicationId;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    BuildSpec, ContainerHandle, ContainerRuntime, ContainerStats, ContainerStatus, HealthState,
    RuntimeError, StartSpec,
};

#[derive(Debug, Clone)]
struct MockContainer {
    handle: ContainerHandle,
    application_id: ApplicationId,
    running: bool,
    healthy: bool,
    stopped_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Script {
    fail_builds: bool,
    fail_starts: bool,
    start_healthy: bool,
    fail_stats: bool,
    fail_stops: bool,
    transient_stats_errors: u32,
    build_delay: Duration,
}

/// Mock runtime.
pub struct MockRuntime {
    counter: AtomicU64,
    builds: AtomicU32,
    script: Mutex<Script>,
    containers: Mutex<HashMap<String, MockContainer>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            builds: AtomicU32::new(0),
            script: Mutex::new(Script {
                start_healthy: true,
                ..Script::default()
            }),
            containers: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.script().fail_builds = fail;
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.script().fail_starts = fail;
    }

    /// Whether containers started from now on report ready.
    pub fn set_start_healthy(&self, healthy: bool) {
        self.script().start_healthy = healthy;
    }

    pub fn set_build_delay(&self, delay: Duration) {
        self.script().build_delay = delay;
    }

    pub fn set_fail_stats(&self, fail: bool) {
        self.script().fail_stats = fail;
    }

    /// Stops fail and leave the container running.
    pub fn set_fail_stops(&self, fail: bool) {
        self.script().fail_stops = fail;
    }

    /// Make the next `count` stats calls fail with a transient error.
    pub fn fail_next_stats(&self, count: u32) {
        self.script().transient_stats_errors = count;
    }

    /// Flip readiness of an existing container.
    pub fn set_healthy(&self, handle: &ContainerHandle, healthy: bool) {
        if let Some(c) = self.containers().get_mut(handle.id()) {
            c.healthy = healthy;
        }
    }

    /// Containers that have not been stopped, in start order.
    pub fn running(&self) -> Vec<ContainerHandle> {
        let mut running: Vec<_> = self
            .containers()
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, c)| (id.clone(), c.handle.clone()))
            .collect();
        running.sort_by(|a, b| a.0.cmp(&b.0));
        running.into_iter().map(|(_, h)| h).collect()
    }

    pub fn running_for(&self, application_id: ApplicationId) -> Vec<ContainerHandle> {
        let mut running: Vec<_> = self
            .containers()
            .iter()
            .filter(|(_, c)| c.running && c.application_id == application_id)
            .map(|(id, c)| (id.clone(), c.handle.clone()))
            .collect();
        running.sort_by(|a, b| a.0.cmp(&b.0));
        running.into_iter().map(|(_, h)| h).collect()
    }

    pub fn is_running(&self, handle: &ContainerHandle) -> bool {
        self.containers()
            .get(handle.id())
            .is_some_and(|c| c.running)
    }

    /// When a container was stopped and removed, if it was.
    pub fn stopped_at(&self, handle: &ContainerHandle) -> Option<Instant> {
        self.containers()
            .get(handle.id())
            .and_then(|c| c.stopped_at)
    }

    pub fn build_count(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> usize {
        self.containers().len()
    }

    fn lookup_id(&self, handle: &ContainerHandle) -> Option<String> {
        let containers = self.containers();
        if containers.contains_key(handle.id()) {
            return Some(handle.id().to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.handle.name() == handle.name())
            .map(|(id, _)| id.clone())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, RuntimeError> {
        let (fail, delay) = {
            let script = self.script();
            (script.fail_builds, script.build_delay)
        };
        self.builds.fetch_add(1, Ordering::SeqCst);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RuntimeError::Build(format!(
                "[MOCK] build of {} failed",
                spec.version
            )));
        }

        let tag = format!("quark-{}:{}", spec.application_id.short(), spec.version);
        debug!(application_id = %spec.application_id, tag = %tag, "[MOCK] Built image");
        Ok(tag)
    }

    async fn start_container(&self, spec: &StartSpec) -> Result<ContainerHandle, RuntimeError> {
        let (fail, healthy) = {
            let script = self.script();
            (script.fail_starts, script.start_healthy)
        };
        if fail {
            return Err(RuntimeError::Permanent("[MOCK] start failed".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock{n:012x}");
        let handle =
            ContainerHandle::new(&id, &spec.name).with_endpoint(format!("10.88.0.{}:8000", n % 250 + 2));

        info!(
            application_id = %spec.application_id,
            container = %handle,
            image = %spec.image,
            cpu = spec.resources.cpu,
            memory_mb = spec.resources.memory_mb,
            "[MOCK] Started container"
        );

        self.containers().insert(
            id,
            MockContainer {
                handle: handle.clone(),
                application_id: spec.application_id,
                running: true,
                healthy,
                stopped_at: None,
            },
        );
        Ok(handle)
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError> {
        let id = self
            .lookup_id(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))?;
        let containers = self.containers();
        let c = containers
            .get(&id)
            .filter(|c| c.running)
            .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))?;
        Ok(ContainerStatus {
            running: c.running,
            health: if c.healthy {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            endpoint: c.handle.endpoint().map(str::to_string),
        })
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let Some(id) = self.lookup_id(handle) else {
            debug!(container = %handle, "[MOCK] Container already gone");
            return Ok(());
        };
        if self.script().fail_stops {
            return Err(RuntimeError::Transient(format!("[MOCK] stop {handle} failed")));
        }
        if let Some(c) = self.containers().get_mut(&id) {
            if c.running {
                c.running = false;
                c.stopped_at = Some(Instant::now());
                info!(container = %handle, "[MOCK] Stopped and removed container");
            }
        }
        Ok(())
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError> {
        {
            let mut script = self.script();
            if script.transient_stats_errors > 0 {
                script.transient_stats_errors -= 1;
                return Err(RuntimeError::Transient("[MOCK] stats unavailable".into()));
            }
            if script.fail_stats {
                return Err(RuntimeError::Permanent("[MOCK] stats failed".into()));
            }
        }
        if !self.is_running(handle) {
            return Err(RuntimeError::NotFound(handle.id().to_string()));
        }
        Ok(ContainerStats {
            cpu_percent: 12.5,
            memory_mb: 128.0,
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
        })
    }
}
