//! quark deployer daemon
//!
//! Wires the Docker runtime, nginx router and file store into an
//! orchestrator, then reads newline-delimited JSON commands from stdin:
//!
//! ```text
//! {"command":"deploy","application_id":"app_...","version":"<sha>"}
//! {"command":"status","deployment_id":"dep_..."}
//! {"command":"cancel","deployment_id":"dep_..."}
//! {"command":"metrics","application_id":"app_...","samples":5}
//! ```
//!
//! Results are written to stdout as JSON lines. On EOF or ctrl-c pending
//! retirements are flushed before exit.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use quark_deployer::{
    Application, Collaborators, Config, ContainerRuntime, Deployment, DeploymentRequest,
    DockerRuntime, FileStore, MetricEvent, MetricsCollector, NginxRouter, Orchestrator,
    ResourceLedger, RuntimeProber, TaskScheduler, TrafficRouter,
};
use quark_id::{ApplicationId, DeploymentId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    Deploy(DeploymentRequest),
    Status {
        deployment_id: DeploymentId,
    },
    Cancel {
        deployment_id: DeploymentId,
    },
    Metrics {
        application_id: ApplicationId,
        #[serde(default = "default_samples")]
        samples: usize,
    },
}

fn default_samples() -> usize {
    10
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum Output<'a> {
    Accepted { deployment_id: DeploymentId },
    Deployment(&'a Deployment),
    Metric(&'a MetricEvent),
    Error { message: String },
}

fn emit(output: &Output<'_>) {
    match serde_json::to_string(output) {
        Ok(line) => println!("{line}"),
        Err(e) => error!(error = %e, "Failed to encode output"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to QUARK_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("Starting quark deployer");
    info!(
        state_file = %config.state_file.display(),
        max_cpu = config.ledger.ceiling.cpu,
        max_memory_mb = config.ledger.ceiling.memory_mb,
        probe_deadline_secs = config.orchestrator.probe_deadline.as_secs(),
        retirement_grace_secs = config.orchestrator.retirement_grace.as_secs(),
        docker_socket = %config.docker.socket_path.display(),
        nginx_conf_dir = %config.nginx.conf_dir.display(),
        "Configuration loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(config.docker.clone()));
    let router: Arc<dyn TrafficRouter> = Arc::new(NginxRouter::new(config.nginx.clone()));
    let store = Arc::new(
        FileStore::open(&config.state_file)
            .await
            .context("Failed to open state file")?,
    );
    let scheduler = Arc::new(TaskScheduler::new());

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        Arc::new(ResourceLedger::new(config.ledger.clone())),
        Arc::clone(&scheduler),
        Collaborators {
            runtime: Arc::clone(&runtime),
            router: Arc::clone(&router),
            prober: Arc::new(RuntimeProber::new(Arc::clone(&runtime), config.probe.clone())),
            store,
        },
    );
    let metrics = MetricsCollector::new(runtime, router, config.metrics.clone());

    orchestrator
        .recover()
        .await
        .context("Failed to recover deployment state")?;

    if let Some(path) = &config.apps_file {
        register_apps(&orchestrator, path).await?;
    }

    let usage = orchestrator.ledger().usage();
    info!(
        committed_cpu_millicores = usage.cpu_millicores,
        committed_memory_mb = usage.memory_mb,
        "Ready for deployment requests"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("Input closed, waiting for running deployments");
                    while running.join_next().await.is_some() {}
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Command>(&line) {
                    Ok(command) => handle(&orchestrator, &metrics, &mut running, command).await,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed command");
                        emit(&Output::Error { message: format!("malformed command: {e}") });
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!(pending = scheduler.pending(), "Flushing scheduled retirements");
    scheduler.shutdown().await;
    info!("quark deployer stopped");
    Ok(())
}

async fn handle(
    orchestrator: &Orchestrator,
    metrics: &MetricsCollector,
    running: &mut JoinSet<()>,
    command: Command,
) {
    match command {
        Command::Deploy(request) => match orchestrator.deploy(request).await {
            Ok(deployment_id) => {
                emit(&Output::Accepted { deployment_id });
                let orchestrator = orchestrator.clone();
                running.spawn(async move {
                    match orchestrator.wait_for_terminal(deployment_id).await {
                        Ok(done) => {
                            info!(
                                deployment_id = %done.id,
                                state = %done.state,
                                failure = done.failure.as_deref().unwrap_or(""),
                                "Deployment finished"
                            );
                            emit(&Output::Deployment(&done));
                        }
                        Err(e) => error!(deployment_id = %deployment_id, error = %e, "Lost track of deployment"),
                    }
                });
            }
            Err(e) => emit(&Output::Error {
                message: e.to_string(),
            }),
        },
        Command::Status { deployment_id } => match orchestrator.get_status(deployment_id).await {
            Ok(deployment) => emit(&Output::Deployment(&deployment)),
            Err(e) => emit(&Output::Error {
                message: e.to_string(),
            }),
        },
        Command::Cancel { deployment_id } => {
            let orchestrator = orchestrator.clone();
            running.spawn(async move {
                match orchestrator.cancel(deployment_id).await {
                    Ok(deployment) => emit(&Output::Deployment(&deployment)),
                    Err(e) => emit(&Output::Error {
                        message: e.to_string(),
                    }),
                }
            });
        }
        Command::Metrics {
            application_id,
            samples,
        } => {
            let feed = metrics.subscribe(application_id).take(samples);
            running.spawn(async move {
                tokio::pin!(feed);
                while let Some(event) = feed.next().await {
                    emit(&Output::Metric(&event));
                }
            });
        }
    }
}

/// Register applications listed in a JSON file, keeping any stored state
/// for applications that already exist.
async fn register_apps(orchestrator: &Orchestrator, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read apps file: {}", path.display()))?;
    let apps: Vec<Application> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse apps file: {}", path.display()))?;

    let mut registered = 0;
    for app in apps {
        if orchestrator.application(app.id).await.is_ok() {
            continue;
        }
        orchestrator.register_application(app).await?;
        registered += 1;
    }
    info!(path = %path.display(), registered, "Applications loaded");
    Ok(())
}
