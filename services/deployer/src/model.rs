//! Domain records: applications, deployment requests, and deployments.
//!
//! The orchestrator is the only writer of `Deployment` records and of an
//! application's container fields. Everything here is plain data so the
//! storage collaborator can persist it as JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quark_id::{ApplicationId, DeploymentId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerHandle;

/// CPU and memory request for one container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in cores (fractions allowed, e.g. `0.5`).
    pub cpu: f64,
    /// Memory in megabytes.
    pub memory_mb: u64,
}

impl Resources {
    pub const fn new(cpu: f64, memory_mb: u64) -> Self {
        Self { cpu, memory_mb }
    }

    /// CPU expressed in integer millicores, the unit the ledger accounts in.
    pub fn cpu_millicores(&self) -> u64 {
        if self.cpu.is_finite() && self.cpu > 0.0 {
            (self.cpu * 1000.0).round() as u64
        } else {
            0
        }
    }

    pub(crate) fn from_millicores(cpu_millicores: u64, memory_mb: u64) -> Self {
        Self {
            cpu: cpu_millicores as f64 / 1000.0,
            memory_mb,
        }
    }
}

impl Default for Resources {
    /// One core and 512 MB, the defaults for a newly registered application.
    fn default() -> Self {
        Self::new(1.0, 512)
    }
}

/// Application lifecycle status as reported to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    /// Registered, never successfully deployed.
    #[default]
    Created,
    /// Serving traffic from `active_container`.
    Running,
}

/// A deployable project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub name: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub status: ApplicationStatus,
    /// Container currently receiving traffic.
    #[serde(default)]
    pub active_container: Option<ContainerHandle>,
    /// Ledger reservation backing `active_container`.
    #[serde(default)]
    pub active_reservation: Option<ReservationId>,
    /// Superseded container waiting out its grace period, or one whose
    /// stop failed and is still to be reclaimed.
    #[serde(default)]
    pub retiring_container: Option<ContainerHandle>,
    /// Ledger reservation backing `retiring_container`.
    #[serde(default)]
    pub retiring_reservation: Option<ReservationId>,
    #[serde(default)]
    pub deployment_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Application {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>, resources: Resources) -> Self {
        let now = Utc::now();
        Self {
            id: ApplicationId::new(),
            name: name.into(),
            repo_url: repo_url.into(),
            branch: default_branch(),
            resources,
            env_vars: BTreeMap::new(),
            status: ApplicationStatus::Created,
            active_container: None,
            active_reservation: None,
            retiring_container: None,
            retiring_reservation: None,
            deployment_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A request to deploy one version of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub application_id: ApplicationId,
    /// Commit sha, tag, or branch to build.
    pub version: String,
    /// Overrides the application's declared resources when set.
    #[serde(default)]
    pub resources: Option<Resources>,
}

impl DeploymentRequest {
    pub fn new(application_id: ApplicationId, version: impl Into<String>) -> Self {
        Self {
            application_id,
            version: version.into(),
            resources: None,
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }
}

/// Orchestration state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Admitted,
    Building,
    Probing,
    CuttingOver,
    Retiring,
    Succeeded,
    AdmissionDenied,
    BuildFailed,
    HealthCheckFailed,
    CutoverFailed,
    Cancelled,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Building => "building",
            Self::Probing => "probing",
            Self::CuttingOver => "cutting_over",
            Self::Retiring => "retiring",
            Self::Succeeded => "succeeded",
            Self::AdmissionDenied => "admission_denied",
            Self::BuildFailed => "build_failed",
            Self::HealthCheckFailed => "health_check_failed",
            Self::CutoverFailed => "cutover_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::AdmissionDenied
                | Self::BuildFailed
                | Self::HealthCheckFailed
                | Self::CutoverFailed
                | Self::Cancelled
        )
    }

    /// States in which a caller may still cancel: no traffic has moved yet.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Admitted | Self::Building | Self::Probing)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_advance_to(&self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, AdmissionDenied)
                | (Admitted, Building)
                | (Admitted, Cancelled)
                | (Building, Probing)
                | (Building, BuildFailed)
                | (Building, Cancelled)
                | (Probing, CuttingOver)
                | (Probing, HealthCheckFailed)
                | (Probing, Cancelled)
                | (CuttingOver, Retiring)
                | (CuttingOver, CutoverFailed)
                | (Retiring, Succeeded)
        )
    }

    /// Terminal outcome implied by a terminal state.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Succeeded => Some(Outcome::Succeeded),
            Self::AdmissionDenied | Self::BuildFailed => Some(Outcome::Failed),
            Self::HealthCheckFailed | Self::CutoverFailed => Some(Outcome::RolledBack),
            Self::Cancelled => Some(Outcome::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished deployment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Failed before a candidate container existed.
    Failed,
    /// Candidate was started and then discarded; the previous version kept serving.
    RolledBack,
    Cancelled,
}

/// A timestamped state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: DeploymentState,
    pub at: DateTime<Utc>,
}

/// One orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: ApplicationId,
    pub version: String,
    pub resources: Resources,
    pub state: DeploymentState,
    /// Container started for this attempt.
    pub candidate: Option<ContainerHandle>,
    /// Container serving traffic when the attempt began.
    pub previous: Option<ContainerHandle>,
    pub reservation: Option<ReservationId>,
    pub transitions: Vec<Transition>,
    /// Reason for a failed or cancelled attempt.
    pub failure: Option<String>,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(
        application_id: ApplicationId,
        version: impl Into<String>,
        resources: Resources,
        previous: Option<ContainerHandle>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::new(),
            application_id,
            version: version.into(),
            resources,
            state: DeploymentState::Pending,
            candidate: None,
            previous,
            reservation: None,
            transitions: vec![Transition {
                state: DeploymentState::Pending,
                at: now,
            }],
            failure: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`, stamping the transition.
    ///
    /// Returns `false` and leaves the record untouched if the move is not a
    /// legal edge of the state machine or the record is already terminal.
    pub fn advance(&mut self, next: DeploymentState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        let now = Utc::now();
        self.state = next;
        self.outcome = next.outcome();
        self.transitions.push(Transition { state: next, at: now });
        self.updated_at = now;
        true
    }

    /// Moves to a failure (or cancelled) state and records why.
    pub fn fail(&mut self, state: DeploymentState, reason: impl Into<String>) -> bool {
        if self.advance(state) {
            self.failure = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// When the deployment entered `state`, if it did.
    pub fn entered_at(&self, state: DeploymentState) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .find(|t| t.state == state)
            .map(|t| t.at)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
