//! In-memory router for tests and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use quark_id::ApplicationId;
use tracing::info;

use super::{RouterError, TrafficRouter};
use crate::runtime::ContainerHandle;

#[derive(Default)]
pub struct MockRouter {
    routes: Mutex<HashMap<ApplicationId, ContainerHandle>>,
    reject: AtomicBool,
    delay: Mutex<Duration>,
    switches: AtomicU32,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every switch from now on, leaving routes untouched.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Make each switch take this long before applying.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Successful switches so far.
    pub fn switch_count(&self) -> u32 {
        self.switches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrafficRouter for MockRouter {
    async fn switch_target(
        &self,
        application_id: ApplicationId,
        target: &ContainerHandle,
    ) -> Result<(), RouterError> {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(RouterError::Rejected("[MOCK] reload refused".into()));
        }

        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(application_id, target.clone());
        self.switches.fetch_add(1, Ordering::SeqCst);
        info!(application_id = %application_id, container = %target, "[MOCK] Traffic switched");
        Ok(())
    }

    async fn remove_target(&self, application_id: ApplicationId) -> Result<(), RouterError> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&application_id);
        Ok(())
    }

    fn current_target(&self, application_id: ApplicationId) -> Option<ContainerHandle> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&application_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_leaves_route() {
        let router = MockRouter::new();
        let app = ApplicationId::new();
        let blue = ContainerHandle::named("blue");
        router.switch_target(app, &blue).await.unwrap();

        router.set_reject(true);
        assert!(router
            .switch_target(app, &ContainerHandle::named("green"))
            .await
            .is_err());
        assert_eq!(router.current_target(app), Some(blue));
        assert_eq!(router.switch_count(), 1);
    }
}
