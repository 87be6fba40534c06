//! Deployment orchestration.
//!
//! One run per accepted request drives the candidate through
//! build, start, probe, cutover and retirement of the previous container:
//!
//! ```text
//! Pending -> Admitted -> Building -> Probing -> CuttingOver -> Retiring -> Succeeded
//!    |                      |           |            |
//! AdmissionDenied      BuildFailed  HealthCheckFailed  CutoverFailed
//! ```
//!
//! Every failure exit stops the candidate and releases its reservation
//! before the terminal state is published. The application record and the
//! router are only touched once cutover succeeds. An application has at most
//! one non-terminal deployment; its lease is held until `Succeeded`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use quark_id::{ApplicationId, DeploymentId, ReservationId};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::ledger::{LedgerError, ResourceLedger};
use crate::model::{
    Application, ApplicationStatus, Deployment, DeploymentRequest, DeploymentState, Resources,
};
use crate::prober::{HealthProber, ProbeOutcome};
use crate::router::{public_host, RouterError, TrafficRouter};
use crate::runtime::{BuildSpec, ContainerHandle, ContainerRuntime, StartSpec};
use crate::scheduler::TaskScheduler;
use crate::store::{Store, StoreError};

/// Upper bounds for each suspension point of a run.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub build: Duration,
    pub start: Duration,
    pub router: Duration,
    pub stop: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(600),
            start: Duration::from_secs(60),
            router: Duration::from_secs(30),
            stop: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a candidate gets to become healthy.
    pub probe_deadline: Duration,
    /// Delay before the superseded container is stopped.
    pub retirement_grace: Duration,
    pub timeouts: StageTimeouts,
    /// Domain used to build `Application::deployment_url`.
    pub public_domain: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_deadline: Duration::from_secs(30),
            retirement_grace: Duration::from_secs(30),
            timeouts: StageTimeouts::default(),
            public_domain: "quark.local".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown application: {0}")]
    UnknownApplication(ApplicationId),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(DeploymentId),

    #[error("invalid deployment request: {0}")]
    InvalidRequest(String),

    #[error("application {application_id} already has deployment {deployment_id} in progress")]
    DeploymentInProgress {
        application_id: ApplicationId,
        deployment_id: DeploymentId,
    },

    #[error("deployment {deployment_id} denied: {source}")]
    AdmissionDenied {
        deployment_id: DeploymentId,
        #[source]
        source: LedgerError,
    },

    #[error("deployment {deployment_id} cannot be cancelled in state {state}")]
    NotCancellable {
        deployment_id: DeploymentId,
        state: DeploymentState,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub router: Arc<dyn TrafficRouter>,
    pub prober: Arc<dyn HealthProber>,
    pub store: Arc<dyn Store>,
}

/// Counts from [`Orchestrator::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub adopted: usize,
    pub interrupted: usize,
    pub retired: usize,
}

struct InFlight {
    deployment_id: DeploymentId,
    cancel: watch::Sender<bool>,
}

struct Inner {
    config: OrchestratorConfig,
    ledger: Arc<ResourceLedger>,
    scheduler: Arc<TaskScheduler>,
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<dyn TrafficRouter>,
    prober: Arc<dyn HealthProber>,
    store: Arc<dyn Store>,
    in_flight: Mutex<HashMap<ApplicationId, InFlight>>,
    watchers: Mutex<HashMap<DeploymentId, watch::Sender<Deployment>>>,
}

/// Per-application exclusivity. Dropping it frees the application.
struct AppLease {
    inner: Arc<Inner>,
    application_id: ApplicationId,
}

impl Drop for AppLease {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.application_id);
    }
}

/// Why a guarded stage did not produce a value.
enum StageError<E> {
    Failed(E),
    TimedOut(Duration),
    Cancelled,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: Arc<ResourceLedger>,
        scheduler: Arc<TaskScheduler>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                scheduler,
                runtime: collaborators.runtime,
                router: collaborators.router,
                prober: collaborators.prober,
                store: collaborators.store,
                in_flight: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.inner.ledger
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    pub async fn register_application(
        &self,
        application: Application,
    ) -> Result<ApplicationId, DeployError> {
        self.inner.store.save_application(&application).await?;
        info!(
            application_id = %application.id,
            name = %application.name,
            repo_url = %application.repo_url,
            "Application registered"
        );
        Ok(application.id)
    }

    pub async fn application(&self, id: ApplicationId) -> Result<Application, DeployError> {
        self.inner
            .store
            .load_application(id)
            .await?
            .ok_or(DeployError::UnknownApplication(id))
    }

    /// Admit a deployment and start running it in the background.
    ///
    /// Returns once the deployment is `Admitted`. A denied admission is
    /// recorded as a terminal `AdmissionDenied` deployment.
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeploymentId, DeployError> {
        let inner = &self.inner;
        let deployment_id = DeploymentId::new();
        let (lease, cancel) = inner.acquire(request.application_id, deployment_id)?;

        // Read under the lease so `previous` is the container serving now,
        // not one an earlier run has since retired.
        let app = inner
            .store
            .load_application(request.application_id)
            .await?
            .ok_or(DeployError::UnknownApplication(request.application_id))?;

        let resources = request.resources.unwrap_or(app.resources);
        validate(&request.version, &resources)?;

        let mut deployment = Deployment::new(
            app.id,
            request.version,
            resources,
            app.active_container.clone(),
        );
        deployment.id = deployment_id;

        let reservation = match inner.ledger.reserve(app.id, &resources) {
            Ok(id) => id,
            Err(source) => {
                warn!(
                    application_id = %app.id,
                    deployment_id = %deployment.id,
                    error = %source,
                    "Deployment denied admission"
                );
                deployment.fail(DeploymentState::AdmissionDenied, source.to_string());
                drop(lease);
                inner.store.save_deployment(&deployment).await?;
                return Err(DeployError::AdmissionDenied {
                    deployment_id: deployment.id,
                    source,
                });
            }
        };

        deployment.reservation = Some(reservation);
        deployment.advance(DeploymentState::Admitted);
        inner.publish(&deployment);
        if let Err(e) = inner.store.save_deployment(&deployment).await {
            inner.discard_watcher(deployment.id);
            if let Err(release) = inner.ledger.release(reservation) {
                warn!(error = %release, "Failed to release reservation");
            }
            return Err(e.into());
        }

        info!(
            application_id = %app.id,
            deployment_id = %deployment.id,
            version = %deployment.version,
            cpu = resources.cpu,
            memory_mb = resources.memory_mb,
            "Deployment admitted"
        );

        let id = deployment.id;
        tokio::spawn(Arc::clone(inner).run(deployment, app, lease, cancel));
        Ok(id)
    }

    /// Current record of a deployment.
    pub async fn get_status(&self, id: DeploymentId) -> Result<Deployment, DeployError> {
        let live = self.inner.watchers().get(&id).map(|tx| tx.borrow().clone());
        if let Some(current) = live {
            return Ok(current);
        }
        self.inner
            .store
            .load_deployment(id)
            .await?
            .ok_or(DeployError::UnknownDeployment(id))
    }

    /// Watch a deployment's record change. Finished deployments yield a
    /// receiver holding the final record.
    pub async fn subscribe_status(
        &self,
        id: DeploymentId,
    ) -> Result<watch::Receiver<Deployment>, DeployError> {
        let live = self.inner.watchers().get(&id).map(watch::Sender::subscribe);
        if let Some(rx) = live {
            return Ok(rx);
        }
        let stored = self
            .inner
            .store
            .load_deployment(id)
            .await?
            .ok_or(DeployError::UnknownDeployment(id))?;
        Ok(watch::channel(stored).1)
    }

    /// Wait until the deployment reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: DeploymentId) -> Result<Deployment, DeployError> {
        let mut rx = self.subscribe_status(id).await?;
        let finished = rx.wait_for(Deployment::is_terminal).await.map(|d| d.clone());
        Ok(finished.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// Cancel a deployment that has not started moving traffic.
    ///
    /// Returns once the candidate is stopped and the reservation released.
    pub async fn cancel(&self, id: DeploymentId) -> Result<Deployment, DeployError> {
        let current = self.get_status(id).await?;
        let not_cancellable = |state| DeployError::NotCancellable {
            deployment_id: id,
            state,
        };
        if !current.state.is_cancellable() {
            return Err(not_cancellable(current.state));
        }

        let mut rx = self.subscribe_status(id).await?;
        let signalled = self
            .inner
            .in_flight()
            .get(&current.application_id)
            .filter(|f| f.deployment_id == id)
            .map(|f| f.cancel.send_replace(true))
            .is_some();
        if !signalled {
            return Err(not_cancellable(current.state));
        }
        info!(deployment_id = %id, state = %current.state, "Cancellation requested");

        let settled = rx
            .wait_for(|d| !d.state.is_cancellable())
            .await
            .map(|d| d.clone());
        let settled = settled.unwrap_or_else(|_| rx.borrow().clone());
        if settled.state == DeploymentState::Cancelled {
            Ok(settled)
        } else {
            Err(not_cancellable(settled.state))
        }
    }

    /// Deployment history of an application, oldest first.
    pub async fn list_deployments(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Deployment>, DeployError> {
        Ok(self.inner.store.list_deployments(application_id).await?)
    }

    /// Reconcile stored state after a restart.
    ///
    /// Re-creates confirmed reservations and routes for active containers,
    /// stops containers that were waiting out their grace period, and closes
    /// deployments that were interrupted mid-run.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, DeployError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for mut app in inner.store.list_applications().await? {
            let history = inner.store.list_deployments(app.id).await?;

            for mut deployment in history.iter().filter(|d| !d.is_terminal()).cloned() {
                inner.close_interrupted(&app, &mut deployment).await;
                report.interrupted += 1;
            }

            // Reservation ids from the previous process mean nothing to
            // this ledger.
            app.retiring_reservation = None;
            if let Some(retiring) = app.retiring_container.take() {
                if inner.stop_quietly(&retiring).await {
                    report.retired += 1;
                } else {
                    let resources = resources_of(&history, &retiring, app.resources);
                    app.retiring_reservation = Some(inner.ledger.adopt(app.id, &resources));
                    app.retiring_container = Some(retiring);
                }
            }

            app.active_reservation = None;
            if let Some(active) = app.active_container.clone() {
                let resources = resources_of(&history, &active, app.resources);
                app.active_reservation = Some(inner.ledger.adopt(app.id, &resources));

                if let Err(e) = inner.router.switch_target(app.id, &active).await {
                    warn!(application_id = %app.id, error = %e, "Failed to re-apply route");
                }
                report.adopted += 1;
            }

            app.updated_at = Utc::now();
            inner.store.save_application(&app).await?;
        }

        info!(
            adopted = report.adopted,
            interrupted = report.interrupted,
            retired = report.retired,
            "Recovered deployment state"
        );
        Ok(report)
    }
}

/// Resources of the deployment that started `container`.
fn resources_of(history: &[Deployment], container: &ContainerHandle, fallback: Resources) -> Resources {
    history
        .iter()
        .rev()
        .find(|d| d.candidate.as_ref() == Some(container))
        .map_or(fallback, |d| d.resources)
}

fn validate(version: &str, resources: &Resources) -> Result<(), DeployError> {
    if version.trim().is_empty() {
        return Err(DeployError::InvalidRequest("version must not be empty".into()));
    }
    if resources.cpu_millicores() == 0 {
        return Err(DeployError::InvalidRequest(format!(
            "cpu must be positive, got {}",
            resources.cpu
        )));
    }
    if resources.memory_mb == 0 {
        return Err(DeployError::InvalidRequest("memory must be positive".into()));
    }
    Ok(())
}

/// Run `fut` unless it overruns `limit` or the deployment is cancelled.
async fn guarded<T, E>(
    cancel: &mut watch::Receiver<bool>,
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, StageError<E>> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(StageError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StageError::Failed(e)),
            Err(_) => Err(StageError::TimedOut(limit)),
        },
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Terminal state and reason for a stage that did not complete.
fn stage_failure<E: std::fmt::Display>(
    failed: DeploymentState,
    operation: &str,
    err: StageError<E>,
) -> (DeploymentState, String) {
    match err {
        StageError::Failed(e) => (failed, format!("{operation}: {e}")),
        StageError::TimedOut(limit) => (failed, format!("{operation} timed out after {limit:?}")),
        StageError::Cancelled => (
            DeploymentState::Cancelled,
            format!("cancelled during {operation}"),
        ),
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<ApplicationId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<DeploymentId, watch::Sender<Deployment>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(
        self: &Arc<Self>,
        application_id: ApplicationId,
        deployment_id: DeploymentId,
    ) -> Result<(AppLease, watch::Receiver<bool>), DeployError> {
        let mut in_flight = self.in_flight();
        if let Some(existing) = in_flight.get(&application_id) {
            debug!(
                application_id = %application_id,
                in_flight = %existing.deployment_id,
                "Rejecting concurrent deployment"
            );
            return Err(DeployError::DeploymentInProgress {
                application_id,
                deployment_id: existing.deployment_id,
            });
        }

        let (cancel, cancelled) = watch::channel(false);
        in_flight.insert(
            application_id,
            InFlight {
                deployment_id,
                cancel,
            },
        );
        let lease = AppLease {
            inner: Arc::clone(self),
            application_id,
        };
        Ok((lease, cancelled))
    }

    /// Push the record to status watchers. Terminal records close the
    /// channel after delivery.
    fn publish(&self, deployment: &Deployment) {
        let mut watchers = self.watchers();
        if deployment.is_terminal() {
            if let Some(tx) = watchers.remove(&deployment.id) {
                tx.send_replace(deployment.clone());
            }
        } else if let Some(tx) = watchers.get(&deployment.id) {
            tx.send_replace(deployment.clone());
        } else {
            watchers.insert(deployment.id, watch::channel(deployment.clone()).0);
        }
    }

    fn discard_watcher(&self, id: DeploymentId) {
        self.watchers().remove(&id);
    }

    /// Record a state change. Live records go to watchers first; terminal
    /// ones reach the store before the watcher closes so status queries
    /// never fall back to a stale copy.
    async fn record(&self, deployment: &Deployment) {
        if deployment.is_terminal() {
            self.save(deployment).await;
            self.publish(deployment);
        } else {
            self.publish(deployment);
            self.save(deployment).await;
        }
    }

    async fn save(&self, deployment: &Deployment) {
        if let Err(e) = self.store.save_deployment(deployment).await {
            error!(deployment_id = %deployment.id, error = %e, "Failed to persist deployment");
        }
    }

    async fn transition(&self, deployment: &mut Deployment, next: DeploymentState) {
        let from = deployment.state;
        if !deployment.advance(next) {
            error!(
                deployment_id = %deployment.id,
                from = %from,
                to = %next,
                "Illegal deployment transition"
            );
            return;
        }
        info!(
            deployment_id = %deployment.id,
            application_id = %deployment.application_id,
            from = %from,
            to = %next,
            "Deployment state changed"
        );
        self.record(deployment).await;
    }

    #[instrument(
        skip_all,
        fields(deployment_id = %deployment.id, application_id = %app.id)
    )]
    async fn run(
        self: Arc<Self>,
        mut deployment: Deployment,
        app: Application,
        lease: AppLease,
        mut cancel: watch::Receiver<bool>,
    ) {
        let timeouts = self.config.timeouts.clone();

        self.transition(&mut deployment, DeploymentState::Building)
            .await;
        let build = BuildSpec {
            application_id: app.id,
            repo_url: app.repo_url.clone(),
            branch: app.branch.clone(),
            version: deployment.version.clone(),
        };
        let image = match guarded(&mut cancel, timeouts.build, self.runtime.build_image(&build))
            .await
        {
            Ok(image) => image,
            Err(e) => {
                let (state, reason) = stage_failure(DeploymentState::BuildFailed, "build", e);
                return self.abort(deployment, lease, None, state, reason).await;
            }
        };

        let start = StartSpec {
            application_id: app.id,
            deployment_id: deployment.id,
            name: StartSpec::container_name(app.id, deployment.id),
            image,
            resources: deployment.resources,
            env: app.env_vars.clone(),
        };
        let candidate =
            match guarded(&mut cancel, timeouts.start, self.runtime.start_container(&start)).await
            {
                Ok(handle) => handle,
                Err(e) => {
                    // Creation may have got far enough to leave a container
                    // behind under the deployment's name.
                    let orphan = ContainerHandle::named(start.name.clone());
                    let (state, reason) = stage_failure(DeploymentState::BuildFailed, "start", e);
                    return self
                        .abort(deployment, lease, Some(orphan), state, reason)
                        .await;
                }
            };
        deployment.candidate = Some(candidate.clone());

        self.transition(&mut deployment, DeploymentState::Probing)
            .await;
        let deadline = self.config.probe_deadline;
        let probe = async {
            match self.prober.wait_until_healthy(&candidate, deadline).await {
                ProbeOutcome::Healthy { attempts, elapsed } => Ok((attempts, elapsed)),
                ProbeOutcome::Timeout { attempts } => Err(format!(
                    "candidate not healthy after {attempts} probes within {deadline:?}"
                )),
            }
        };
        match guarded(&mut cancel, deadline, probe).await {
            Ok((attempts, elapsed)) => {
                debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "Candidate healthy");
            }
            Err(e) => {
                let (state, reason) = match e {
                    StageError::Failed(reason) => (DeploymentState::HealthCheckFailed, reason),
                    other => stage_failure(DeploymentState::HealthCheckFailed, "probe", other),
                };
                return self
                    .abort(deployment, lease, Some(candidate), state, reason)
                    .await;
            }
        }

        self.transition(&mut deployment, DeploymentState::CuttingOver)
            .await;
        let switched =
            tokio::time::timeout(timeouts.router, self.router.switch_target(app.id, &candidate))
                .await;
        let failure = match switched {
            Ok(Ok(())) => None,
            Ok(Err(e @ RouterError::Restore { .. })) => {
                self.restore_route(app.id, deployment.previous.as_ref()).await;
                Some(format!("cutover: {e}"))
            }
            Ok(Err(e)) => Some(format!("cutover: {e}")),
            Err(_) => {
                self.restore_route(app.id, deployment.previous.as_ref()).await;
                Some(format!("cutover timed out after {:?}", timeouts.router))
            }
        };
        if let Some(reason) = failure {
            return self
                .abort(
                    deployment,
                    lease,
                    Some(candidate),
                    DeploymentState::CutoverFailed,
                    reason,
                )
                .await;
        }

        self.complete_cutover(deployment, app, lease, candidate)
            .await;
    }

    /// Cutover succeeded: make the candidate the application's active
    /// container and hand the previous one to the scheduler.
    async fn complete_cutover(
        self: Arc<Self>,
        mut deployment: Deployment,
        app: Application,
        lease: AppLease,
        candidate: ContainerHandle,
    ) {
        if let Some(reservation) = deployment.reservation {
            if let Err(e) = self.ledger.promote(reservation) {
                error!(error = %e, "Failed to confirm reservation");
            }
        }

        let mut current = match self.store.load_application(app.id).await {
            Ok(Some(current)) => current,
            Ok(None) => app,
            Err(e) => {
                warn!(error = %e, "Failed to reload application, using admission copy");
                app
            }
        };
        if let Some(stuck) = current.retiring_container.take() {
            let held = current.retiring_reservation.take();
            if self.stop_quietly(&stuck).await {
                self.release_quietly(held);
            } else {
                error!(
                    container = %stuck,
                    reservation_id = ?held,
                    "Container left by an earlier failed stop is still running"
                );
            }
        }

        let previous_reservation = current.active_reservation;
        current.active_container = Some(candidate.clone());
        current.active_reservation = deployment.reservation;
        current.retiring_container = deployment.previous.clone();
        current.retiring_reservation = deployment.previous.as_ref().and(previous_reservation);
        current.status = ApplicationStatus::Running;
        current.deployment_url = Some(format!(
            "http://{}",
            public_host(current.id, &self.config.public_domain)
        ));
        current.updated_at = Utc::now();
        if let Err(e) = self.store.save_application(&current).await {
            error!(error = %e, "Failed to persist application after cutover");
        }
        info!(container = %candidate, "Traffic cut over to candidate");

        self.transition(&mut deployment, DeploymentState::Retiring)
            .await;

        let Some(previous) = deployment.previous.clone() else {
            self.release_quietly(previous_reservation);
            return self.succeed(deployment, lease).await;
        };

        let grace = self.config.retirement_grace;
        info!(
            container = %previous,
            grace_secs = grace.as_secs_f64(),
            "Previous container scheduled for retirement"
        );
        let inner = Arc::clone(&self);
        self.scheduler.schedule(grace, "retire-container", async move {
            inner
                .retire(deployment, lease, previous, previous_reservation)
                .await
        });
    }

    async fn retire(
        self: Arc<Self>,
        deployment: Deployment,
        lease: AppLease,
        previous: ContainerHandle,
        reservation: Option<ReservationId>,
    ) -> Result<(), String> {
        let stopped = match tokio::time::timeout(
            self.config.timeouts.stop,
            self.runtime.stop_container(&previous),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("stop {previous}: {e}")),
            Err(_) => Err(format!(
                "stop {previous} timed out after {:?}",
                self.config.timeouts.stop
            )),
        };
        // A container that may still be running keeps its reservation and
        // stays recorded for the next cutover or `recover` to reclaim.
        if stopped.is_ok() {
            self.release_quietly(reservation);
            match self.store.load_application(deployment.application_id).await {
                Ok(Some(mut app)) if app.retiring_container.as_ref() == Some(&previous) => {
                    app.retiring_container = None;
                    app.retiring_reservation = None;
                    app.updated_at = Utc::now();
                    if let Err(e) = self.store.save_application(&app).await {
                        warn!(error = %e, "Failed to clear retiring container");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to load application during retirement"),
            }
        } else {
            warn!(
                container = %previous,
                "Previous container may still be running, keeping its reservation"
            );
        }

        self.succeed(deployment, lease).await;
        stopped
    }

    async fn succeed(&self, mut deployment: Deployment, lease: AppLease) {
        let from = deployment.state;
        if deployment.advance(DeploymentState::Succeeded) {
            info!(
                deployment_id = %deployment.id,
                application_id = %deployment.application_id,
                from = %from,
                to = %DeploymentState::Succeeded,
                "Deployment succeeded"
            );
        }
        drop(lease);
        self.record(&deployment).await;
    }

    /// Guaranteed cleanup for every failure and cancellation exit.
    async fn abort(
        &self,
        mut deployment: Deployment,
        lease: AppLease,
        candidate: Option<ContainerHandle>,
        state: DeploymentState,
        reason: String,
    ) {
        if state == DeploymentState::Cancelled {
            info!(deployment_id = %deployment.id, reason = %reason, "Deployment cancelled, cleaning up");
        } else {
            error!(
                deployment_id = %deployment.id,
                application_id = %deployment.application_id,
                state = %state,
                reason = %reason,
                "Deployment failed, cleaning up"
            );
        }

        let stopped = match &candidate {
            Some(candidate) => self.stop_quietly(candidate).await,
            None => true,
        };
        if stopped {
            self.release_quietly(deployment.reservation);
        } else if let Some(candidate) = candidate {
            self.hold_unstopped(&deployment, candidate).await;
        }

        let from = deployment.state;
        if !deployment.fail(state, reason) {
            error!(from = %from, to = %state, "Illegal deployment transition");
        }
        drop(lease);
        self.record(&deployment).await;
    }

    /// Stop and remove a container. Returns false if it may still be running.
    async fn stop_quietly(&self, container: &ContainerHandle) -> bool {
        let stop = self.runtime.stop_container(container);
        match tokio::time::timeout(self.config.timeouts.stop, stop).await {
            Ok(Ok(())) => {
                debug!(container = %container, "Container removed");
                true
            }
            Ok(Err(e)) => {
                warn!(container = %container, error = %e, "Failed to remove container");
                false
            }
            Err(_) => {
                warn!(container = %container, "Timed out removing container");
                false
            }
        }
    }

    /// Record a candidate that would not stop so its reservation is
    /// released only once the container is gone.
    async fn hold_unstopped(&self, deployment: &Deployment, candidate: ContainerHandle) {
        let mut app = match self.store.load_application(deployment.application_id).await {
            Ok(Some(app)) => app,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, container = %candidate, "Failed to record unstopped candidate");
                return;
            }
        };
        if app.retiring_container.is_some() {
            error!(
                container = %candidate,
                reservation_id = ?deployment.reservation,
                "Unstopped candidate cannot be recorded, reservation stays held"
            );
            return;
        }

        warn!(container = %candidate, "Candidate may still be running, keeping its reservation");
        app.retiring_container = Some(candidate);
        app.retiring_reservation = deployment.reservation;
        app.updated_at = Utc::now();
        if let Err(e) = self.store.save_application(&app).await {
            error!(error = %e, "Failed to record unstopped candidate");
        }
    }

    fn release_quietly(&self, reservation: Option<ReservationId>) {
        if let Some(id) = reservation {
            if let Err(e) = self.ledger.release(id) {
                warn!(reservation_id = %id, error = %e, "Failed to release reservation");
            }
        }
    }

    /// Put the application's mapping back after a switch of unknown outcome.
    async fn restore_route(&self, application_id: ApplicationId, previous: Option<&ContainerHandle>) {
        let limit = self.config.timeouts.router;
        let restored = match previous {
            Some(previous) => {
                tokio::time::timeout(limit, self.router.switch_target(application_id, previous))
                    .await
            }
            None => tokio::time::timeout(limit, self.router.remove_target(application_id)).await,
        };
        match restored {
            Ok(Ok(())) => info!(application_id = %application_id, "Previous route restored"),
            Ok(Err(e)) => {
                error!(application_id = %application_id, error = %e, "Failed to restore route")
            }
            Err(_) => error!(application_id = %application_id, "Timed out restoring route"),
        }
    }

    /// Close a deployment the previous process left mid-run.
    async fn close_interrupted(&self, app: &Application, deployment: &mut Deployment) {
        let candidate = deployment
            .candidate
            .clone()
            .unwrap_or_else(|| ContainerHandle::named(StartSpec::container_name(app.id, deployment.id)));
        let took_traffic = app.active_container.as_ref() == Some(&candidate);

        let closing = match deployment.state {
            DeploymentState::Pending => Some(DeploymentState::AdmissionDenied),
            DeploymentState::Admitted => {
                deployment.advance(DeploymentState::Building);
                Some(DeploymentState::BuildFailed)
            }
            DeploymentState::Building => Some(DeploymentState::BuildFailed),
            DeploymentState::Probing => Some(DeploymentState::HealthCheckFailed),
            DeploymentState::CuttingOver if !took_traffic => Some(DeploymentState::CutoverFailed),
            _ => None,
        };

        match closing {
            Some(state) => {
                self.stop_quietly(&candidate).await;
                deployment.fail(state, "interrupted by restart");
            }
            None => {
                if deployment.state == DeploymentState::CuttingOver {
                    deployment.advance(DeploymentState::Retiring);
                }
                if let Some(previous) = deployment.previous.as_ref() {
                    if app.retiring_container.as_ref() != Some(previous) {
                        self.stop_quietly(previous).await;
                    }
                }
                deployment.advance(DeploymentState::Succeeded);
            }
        }

        warn!(
            deployment_id = %deployment.id,
            state = %deployment.state,
            "Closed deployment interrupted by restart"
        );
        self.save(deployment).await;
    }
}
