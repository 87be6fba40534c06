//! Deployer configuration.
//!
//! Everything is read from `QUARK_*` environment variables with documented
//! defaults, then handed to each component at construction.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::ledger::LedgerConfig;
use crate::metrics::MetricsConfig;
use crate::model::Resources;
use crate::orchestrator::{OrchestratorConfig, StageTimeouts};
use crate::prober::ProbeConfig;
use crate::router::NginxConfig;
use crate::runtime::DockerConfig;

/// Deployer configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// JSON state file for applications and deployments.
    pub state_file: PathBuf,

    /// Optional JSON array of applications to register at startup.
    pub apps_file: Option<PathBuf>,

    pub ledger: LedgerConfig,
    pub orchestrator: OrchestratorConfig,
    pub probe: ProbeConfig,
    pub metrics: MetricsConfig,
    pub docker: DockerConfig,
    pub nginx: NginxConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_level = var("QUARK_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let state_file = var("QUARK_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/quark/state.json"));
        let apps_file = var("QUARK_APPS_FILE").map(PathBuf::from);

        let ledger = LedgerConfig {
            ceiling: Resources::new(
                parse(&var, "QUARK_MAX_CPU", 4.0)?,
                parse(&var, "QUARK_MAX_MEMORY_MB", 14 * 1024)?,
            ),
        };
        anyhow::ensure!(
            ledger.ceiling.cpu_millicores() > 0,
            "QUARK_MAX_CPU must be positive."
        );

        let domain = var("QUARK_DOMAIN").unwrap_or_else(|| "quark.local".to_string());

        let orchestrator = OrchestratorConfig {
            probe_deadline: secs(&var, "QUARK_PROBE_DEADLINE_SECS", 30)?,
            retirement_grace: secs(&var, "QUARK_RETIREMENT_GRACE_SECS", 30)?,
            timeouts: StageTimeouts {
                build: secs(&var, "QUARK_BUILD_TIMEOUT_SECS", 600)?,
                start: secs(&var, "QUARK_START_TIMEOUT_SECS", 60)?,
                router: secs(&var, "QUARK_ROUTER_TIMEOUT_SECS", 30)?,
                stop: secs(&var, "QUARK_STOP_TIMEOUT_SECS", 30)?,
            },
            public_domain: domain.clone(),
        };

        let probe = ProbeConfig {
            interval: millis(&var, "QUARK_PROBE_INTERVAL_MS", 1000)?.max(Duration::from_millis(10)),
            jitter: parse(&var, "QUARK_PROBE_JITTER", 0.25)?,
            http_path: var("QUARK_PROBE_HTTP_PATH"),
            http_timeout: millis(&var, "QUARK_PROBE_HTTP_TIMEOUT_MS", 2000)?,
        };

        let metrics = MetricsConfig {
            interval: millis(&var, "QUARK_METRICS_INTERVAL_MS", 1000)?.max(Duration::from_millis(50)),
            channel_capacity: parse(&var, "QUARK_METRICS_CHANNEL_CAPACITY", 64)?,
        };

        let docker = DockerConfig {
            socket_path: var("QUARK_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock")),
            container_port: parse(&var, "QUARK_CONTAINER_PORT", 8000)?,
            image_prefix: var("QUARK_IMAGE_PREFIX").unwrap_or_else(|| "quark-app".to_string()),
            network: var("QUARK_DOCKER_NETWORK"),
            ..DockerConfig::default()
        };

        let nginx_defaults = NginxConfig::default();
        let nginx = NginxConfig {
            conf_dir: var("QUARK_NGINX_CONF_DIR")
                .map(PathBuf::from)
                .unwrap_or(nginx_defaults.conf_dir),
            domain,
            listen_port: parse(&var, "QUARK_NGINX_LISTEN_PORT", 80)?,
            validate_command: var("QUARK_NGINX_VALIDATE_CMD")
                .map(|v| split_command(&v))
                .unwrap_or(nginx_defaults.validate_command),
            reload_command: var("QUARK_NGINX_RELOAD_CMD")
                .map(|v| split_command(&v))
                .unwrap_or(nginx_defaults.reload_command),
            command_timeout: secs(&var, "QUARK_NGINX_COMMAND_TIMEOUT_SECS", 30)?,
        };

        Ok(Self {
            log_level,
            state_file,
            apps_file,
            ledger,
            orchestrator,
            probe,
            metrics,
            docker,
            nginx,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} has an invalid value."))
        .map(|v| v.unwrap_or(default))
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    parse(var, key, default).map(Duration::from_secs)
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    parse(var, key, default).map(Duration::from_millis)
}

/// Split a command line on whitespace.
fn split_command(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.ledger.ceiling, Resources::new(4.0, 14336));
        assert_eq!(config.orchestrator.probe_deadline, Duration::from_secs(30));
        assert_eq!(config.orchestrator.retirement_grace, Duration::from_secs(30));
        assert_eq!(config.orchestrator.timeouts.build, Duration::from_secs(600));
        assert_eq!(config.probe.interval, Duration::from_secs(1));
        assert_eq!(config.metrics.interval, Duration::from_secs(1));
        assert_eq!(config.docker.container_port, 8000);
        assert_eq!(config.nginx.conf_dir, PathBuf::from("/etc/nginx/sites-enabled"));
        assert_eq!(config.nginx.validate_command, vec!["nginx", "-t"]);
        assert!(config.apps_file.is_none());
        assert!(config.probe.http_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("QUARK_MAX_CPU", "2"),
            ("QUARK_MAX_MEMORY_MB", "4096"),
            ("QUARK_RETIREMENT_GRACE_SECS", "10"),
            ("QUARK_PROBE_HTTP_PATH", "/health"),
            ("QUARK_NGINX_RELOAD_CMD", "systemctl reload nginx"),
            ("QUARK_DOMAIN", "apps.example.com"),
        ])
        .unwrap();

        assert_eq!(config.ledger.ceiling, Resources::new(2.0, 4096));
        assert_eq!(config.orchestrator.retirement_grace, Duration::from_secs(10));
        assert_eq!(config.probe.http_path.as_deref(), Some("/health"));
        assert_eq!(config.nginx.reload_command, vec!["systemctl", "reload", "nginx"]);
        assert_eq!(config.nginx.domain, "apps.example.com");
        assert_eq!(config.orchestrator.public_domain, "apps.example.com");
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = load(&[("QUARK_PROBE_DEADLINE_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("QUARK_PROBE_DEADLINE_SECS"));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("QUARK_MAX_CPU", "  ")]).unwrap();
        assert_eq!(config.ledger.ceiling.cpu, 4.0);
    }

    #[test]
    fn test_zero_cpu_ceiling_rejected() {
        assert!(load(&[("QUARK_MAX_CPU", "0")]).is_err());
    }
}
