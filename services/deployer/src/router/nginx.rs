//! Nginx router.
//!
//! Each application gets one file, `quark_<app>.conf`, in nginx's include
//! directory. A switch writes the new file to a staging path, fsyncs it,
//! renames it over the live file, then runs the validate and reload commands.
//! If either command fails the previous file is put back the same way, so
//! nginx never loads a half-written or rejected config.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quark_id::ApplicationId;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{public_host, Route, RouteTable, RouterError, TrafficRouter};
use crate::runtime::ContainerHandle;

#[derive(Debug, Clone)]
pub struct NginxConfig {
    /// Directory nginx includes site configs from.
    pub conf_dir: PathBuf,
    /// Public hostnames are `<app>.<domain>`.
    pub domain: String,
    pub listen_port: u16,
    /// Checks the full config; empty skips validation.
    pub validate_command: Vec<String>,
    /// Makes nginx pick up the new config; empty skips reload.
    pub reload_command: Vec<String>,
    /// Bound on each command.
    pub command_timeout: Duration,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            domain: "quark.local".to_string(),
            listen_port: 80,
            validate_command: vec!["nginx".into(), "-t".into()],
            reload_command: vec!["nginx".into(), "-s".into(), "reload".into()],
            command_timeout: Duration::from_secs(30),
        }
    }
}

pub struct NginxRouter {
    config: NginxConfig,
    table: RouteTable,
    /// nginx validates the whole config, so switches for different
    /// applications must not interleave either.
    switch_lock: Mutex<()>,
}

impl NginxRouter {
    pub fn new(config: NginxConfig) -> Self {
        Self {
            config,
            table: RouteTable::new(),
            switch_lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn conf_path(&self, application_id: ApplicationId) -> PathBuf {
        self.config
            .conf_dir
            .join(format!("quark_{application_id}.conf"))
    }

    pub fn server_name(&self, application_id: ApplicationId) -> String {
        public_host(application_id, &self.config.domain)
    }

    pub fn render(&self, application_id: ApplicationId, endpoint: &str) -> String {
        let upstream = format!("quark_{}", application_id.to_string().to_lowercase());
        format!(
            "# managed by quark; do not edit\n\
             upstream {upstream} {{\n    server {endpoint};\n}}\n\n\
             server {{\n    listen {port};\n    server_name {server_name};\n\n    \
             location / {{\n        proxy_pass http://{upstream};\n        \
             proxy_set_header Host $host;\n        \
             proxy_set_header X-Real-IP $remote_addr;\n        \
             proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n        \
             proxy_set_header X-Forwarded-Proto $scheme;\n    }}\n}}\n",
            port = self.config.listen_port,
            server_name = self.server_name(application_id),
        )
    }

    /// Replace the application's file with `next` (or remove it), then
    /// validate and reload. Restores the previous file on failure.
    async fn replace(
        &self,
        application_id: ApplicationId,
        next: Option<&str>,
    ) -> Result<(), RouterError> {
        let _guard = self.switch_lock.lock().await;
        let path = self.conf_path(application_id);

        let previous = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(source) => return Err(RouterError::Write { path, source }),
        };
        if previous.as_deref() == next {
            debug!(application_id = %application_id, "Proxy config unchanged");
            return Ok(());
        }

        install(&path, next).await?;

        let applied = match self.run(&self.config.validate_command, "validate").await {
            Ok(()) => self
                .run(&self.config.reload_command, "reload")
                .await
                .map_err(|e| match e {
                    RouterError::Validation(msg) => RouterError::Reload(msg),
                    other => other,
                }),
            Err(e) => Err(e),
        };

        let Err(cause) = applied else {
            return Ok(());
        };

        warn!(
            application_id = %application_id,
            path = %path.display(),
            error = %cause,
            "Proxy config rejected, restoring previous config"
        );
        if let Err(restore) = install(&path, previous.as_deref()).await {
            return Err(RouterError::Restore {
                cause: Box::new(cause),
                restore: restore.to_string(),
            });
        }
        Err(cause)
    }

    /// Run one configured command. Failures come back as `Validation`; the
    /// caller relabels reload failures.
    async fn run(&self, argv: &[String], operation: &'static str) -> Result<(), RouterError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.command_timeout, child)
            .await
            .map_err(|_| RouterError::Timeout {
                operation,
                timeout: self.config.command_timeout,
            })?
            .map_err(|e| RouterError::Validation(format!("{program}: {e}")))?;

        if output.status.success() {
            debug!(command = %argv.join(" "), "Proxy command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RouterError::Validation(format!(
                "`{}` exited with {}: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Write `content` to a staging sibling, fsync, and rename it over `path`.
/// `None` removes `path`.
async fn install(path: &Path, content: Option<&str>) -> Result<(), RouterError> {
    let write_err = |source| RouterError::Write {
        path: path.to_path_buf(),
        source,
    };

    let Some(content) = content else {
        return match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_err(e)),
        };
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let staging = path.with_extension("conf.staging");
    let mut file = tokio::fs::File::create(&staging)
        .await
        .map_err(write_err)?;
    file.write_all(content.as_bytes()).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    tokio::fs::rename(&staging, path).await.map_err(write_err)
}

#[async_trait]
impl TrafficRouter for NginxRouter {
    #[instrument(skip_all, fields(application_id = %application_id, container = %target))]
    async fn switch_target(
        &self,
        application_id: ApplicationId,
        target: &ContainerHandle,
    ) -> Result<(), RouterError> {
        let endpoint = target
            .endpoint()
            .ok_or_else(|| RouterError::MissingEndpoint(target.name().to_string()))?;
        let content = self.render(application_id, endpoint);

        self.replace(application_id, Some(&content)).await?;

        let server_name = self.server_name(application_id);
        info!(server_name = %server_name, endpoint = endpoint, "Traffic switched");
        self.table.upsert(Route {
            application_id,
            target: target.clone(),
            server_name,
            switched_at: Utc::now(),
        });
        Ok(())
    }

    async fn remove_target(&self, application_id: ApplicationId) -> Result<(), RouterError> {
        self.replace(application_id, None).await?;
        self.table.remove(application_id);
        info!(application_id = %application_id, "Route removed");
        Ok(())
    }

    fn current_target(&self, application_id: ApplicationId) -> Option<ContainerHandle> {
        self.table.get(application_id).map(|r| r.target)
    }
}
