//! Traffic routing.
//!
//! A router maps an application to the one container that receives its
//! traffic. Switching is all-or-nothing: either every later request reaches
//! the new target, or the existing mapping is left exactly as it was.

mod mock;
mod nginx;
mod table;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use quark_id::ApplicationId;
use thiserror::Error;

use crate::runtime::ContainerHandle;

pub use mock::MockRouter;
pub use nginx::{NginxConfig, NginxRouter};
pub use table::{Route, RouteTable};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("container {0} has no network endpoint")]
    MissingEndpoint(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy rejected configuration: {0}")]
    Validation(String),

    #[error("proxy reload failed: {0}")]
    Reload(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("router rejected switch: {0}")]
    Rejected(String),

    /// The switch failed and the previous mapping could not be put back.
    #[error("{cause}; restoring previous config also failed: {restore}")]
    Restore {
        #[source]
        cause: Box<RouterError>,
        restore: String,
    },
}

/// Public hostname of an application: `app_01ARZ...` under `quark.local`
/// becomes `app-01arz....quark.local`.
pub fn public_host(application_id: ApplicationId, domain: &str) -> String {
    format!(
        "{}.{}",
        application_id.to_string().to_lowercase().replace('_', "-"),
        domain
    )
}

/// Reverse-proxy adapter.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Point all traffic for `application_id` at `target`.
    async fn switch_target(
        &self,
        application_id: ApplicationId,
        target: &ContainerHandle,
    ) -> Result<(), RouterError>;

    /// Drop the mapping for `application_id`. Missing mappings are not an error.
    async fn remove_target(&self, application_id: ApplicationId) -> Result<(), RouterError>;

    /// Container currently receiving the application's traffic.
    fn current_target(&self, application_id: ApplicationId) -> Option<ContainerHandle>;
}
