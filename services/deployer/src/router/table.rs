//! In-memory view of applied routes.
//!
//! Readers load a consistent snapshot without blocking; writers swap in a new
//! map. Only mappings the proxy has accepted are ever stored here.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use quark_id::ApplicationId;

use crate::runtime::ContainerHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub application_id: ApplicationId,
    pub target: ContainerHandle,
    pub server_name: String,
    pub switched_at: DateTime<Utc>,
}

pub struct RouteTable {
    snapshot: ArcSwap<HashMap<ApplicationId, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, application_id: ApplicationId) -> Option<Route> {
        self.snapshot.load().get(&application_id).cloned()
    }

    pub fn upsert(&self, route: Route) {
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(route.application_id, route.clone());
            next
        });
    }

    pub fn remove(&self, application_id: ApplicationId) {
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&application_id);
            next
        });
    }

    /// Point-in-time copy of every route.
    pub fn snapshot(&self) -> Arc<HashMap<ApplicationId, Route>> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
