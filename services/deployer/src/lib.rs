//! quark deployer
//!
//! Blue-green deployment core: admits deployment requests against a host
//! resource ceiling, builds and starts the new version next to the running
//! one, waits for it to become healthy, cuts traffic over atomically, and
//! retires the old container after a grace period.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── ResourceLedger     (admission against the CPU/memory ceiling)
//! ├── ContainerRuntime   (Docker Engine, or MockRuntime)
//! ├── HealthProber       (polls the candidate until healthy or deadline)
//! ├── TrafficRouter      (nginx validate-then-swap, or MockRouter)
//! ├── TaskScheduler      (delayed retirement of superseded containers)
//! └── Store              (applications and deployment records)
//!
//! MetricsCollector       (per-application stats feed, reads the runtime)
//! ```
//!
//! ## Modules
//!
//! - `orchestrator`: deployment state machine and public entry points
//! - `ledger`: resource reservations
//! - `runtime`: container runtime interface and implementations
//! - `router`: traffic router interface and implementations
//! - `prober`: candidate health probing
//! - `metrics`: live metrics feed
//! - `scheduler`: delayed background tasks
//! - `store`: persistence collaborator
//! - `config`: env-driven configuration

pub mod backoff;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod prober;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use ledger::{LedgerConfig, LedgerError, ResourceLedger};
pub use metrics::{MetricEvent, MetricSample, MetricsCollector, MetricsConfig, MetricsSubscription};
pub use model::{
    Application, ApplicationStatus, Deployment, DeploymentRequest, DeploymentState, Outcome,
    Resources,
};
pub use orchestrator::{
    Collaborators, DeployError, Orchestrator, OrchestratorConfig, RecoveryReport, StageTimeouts,
};
pub use prober::{HealthProber, ProbeConfig, ProbeOutcome, RuntimeProber};
pub use router::{MockRouter, NginxConfig, NginxRouter, RouterError, TrafficRouter};
pub use runtime::{ContainerHandle, ContainerRuntime, DockerConfig, DockerRuntime, MockRuntime};
pub use scheduler::TaskScheduler;
pub use store::{FileStore, InMemoryStore, Store, StoreError};
