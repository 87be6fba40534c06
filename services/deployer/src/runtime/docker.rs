//! Docker Engine runtime.
//!
//! Talks to the Engine HTTP API over its unix socket. Images are built from
//! the application's git remote at the requested version; containers get a
//! per-deployment name so the old and new version can run side by side.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    with_retry, BuildSpec, ContainerHandle, ContainerRuntime, ContainerStats, ContainerStatus,
    HealthState, RuntimeError, StartSpec,
};
use crate::backoff::BackoffPolicy;

const MIB: u64 = 1024 * 1024;

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Engine socket.
    pub socket_path: PathBuf,
    /// Port the application listens on inside the container.
    pub container_port: u16,
    /// Image repository prefix; tags are `{prefix}-{app}:{version}`.
    pub image_prefix: String,
    /// Optional user-defined network to attach containers to.
    pub network: Option<String>,
    /// Seconds the engine waits for a graceful stop before killing.
    pub stop_grace_secs: u32,
    /// Retry policy for idempotent engine calls.
    pub retry: BackoffPolicy,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            container_port: 8000,
            image_prefix: "quark-app".to_string(),
            network: None,
            stop_grace_secs: 10,
            retry: BackoffPolicy::default(),
        }
    }
}

/// Docker Engine client implementing the runtime interface.
pub struct DockerRuntime {
    config: DockerConfig,
    client: Client<UnixConnector>,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            client: Client::unix(),
        }
    }

    /// Perform one request against the engine.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Vec<u8>), RuntimeError> {
        let uri = Uri::new(&self.config.socket_path, path);
        debug!(method = %method, path = path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");

        let body = match body {
            Some(value) => {
                builder = builder.header("Content-Type", "application/json");
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| RuntimeError::Permanent(format!("encode request: {e}")))?;
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        let request = builder
            .body(body)
            .map_err(|e| RuntimeError::Permanent(format!("build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RuntimeError::Transient(format!("docker socket: {e}")))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| RuntimeError::Transient(format!("docker response: {e}")))?;

        Ok((status, bytes.to_vec()))
    }

    async fn inspect_once(&self, handle: &ContainerHandle) -> Result<RawInspect, RuntimeError> {
        let path = format!("/containers/{}/json", handle.id());
        let (status, body) = self.call(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(classify(status, &body, handle.id()));
        }
        serde_json::from_slice(&body)
            .map_err(|e| RuntimeError::Permanent(format!("decode inspect: {e}")))
    }

    fn endpoint_of(&self, raw: &RawInspect) -> Option<String> {
        let networks = &raw.network_settings.networks;
        let ip = match &self.config.network {
            Some(name) => networks.get(name).map(|n| n.ip_address.as_str()),
            None => networks
                .values()
                .map(|n| n.ip_address.as_str())
                .find(|ip| !ip.is_empty()),
        }?;
        (!ip.is_empty()).then(|| format!("{ip}:{}", self.config.container_port))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, RuntimeError> {
        let tag = format!(
            "{}-{}:{}",
            self.config.image_prefix,
            spec.application_id.short(),
            sanitize_tag(&spec.version)
        );
        let remote = format!("{}#{}", spec.repo_url, spec.version);
        let path = with_query("/build", &[("t", &tag), ("remote", &remote), ("rm", "1")])?;

        info!(
            application_id = %spec.application_id,
            version = %spec.version,
            tag = %tag,
            "Building image"
        );

        let (status, body) = self.call(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(RuntimeError::Build(engine_message(&body)));
        }
        if let Some(error) = build_stream_error(&body) {
            return Err(RuntimeError::Build(error));
        }

        Ok(tag)
    }

    async fn start_container(&self, spec: &StartSpec) -> Result<ContainerHandle, RuntimeError> {
        let env: Vec<String> = std::iter::once(format!("APP_ID={}", spec.application_id))
            .chain(spec.env.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        let port = format!("{}/tcp", self.config.container_port);

        let mut host_config = json!({
            "NanoCpus": (spec.resources.cpu_millicores() * 1_000_000),
            "Memory": spec.resources.memory_mb * MIB,
            "RestartPolicy": { "Name": "unless-stopped" },
        });
        if let Some(network) = &self.config.network {
            host_config["NetworkMode"] = json!(network);
        }

        let body = json!({
            "Image": spec.image,
            "Env": env,
            "ExposedPorts": { port: {} },
            "Labels": {
                "quark.application": spec.application_id.to_string(),
                "quark.deployment": spec.deployment_id.to_string(),
            },
            "HostConfig": host_config,
        });

        let path = with_query("/containers/create", &[("name", &spec.name)])?;
        let (status, resp) = self.call(Method::POST, &path, Some(body)).await?;
        if !status.is_success() {
            return Err(classify(status, &resp, &spec.name));
        }
        let created: CreatedContainer = serde_json::from_slice(&resp)
            .map_err(|e| RuntimeError::Permanent(format!("decode create: {e}")))?;

        let handle = ContainerHandle::new(created.id, spec.name.clone());

        let start_path = format!("/containers/{}/start", handle.id());
        with_retry(&self.config.retry, "start_container", || async {
            let (status, resp) = self.call(Method::POST, &start_path, None).await?;
            // 304: already started
            if status.is_success() || status == StatusCode::NOT_MODIFIED {
                Ok(())
            } else {
                Err(classify(status, &resp, handle.id()))
            }
        })
        .await?;

        let raw = with_retry(&self.config.retry, "inspect", || self.inspect_once(&handle)).await?;
        let handle = match self.endpoint_of(&raw) {
            Some(endpoint) => handle.with_endpoint(endpoint),
            None => {
                warn!(container = %handle, "Started container has no network address");
                handle
            }
        };

        info!(
            application_id = %spec.application_id,
            deployment_id = %spec.deployment_id,
            container = %handle,
            endpoint = handle.endpoint().unwrap_or("-"),
            "Container started"
        );
        Ok(handle)
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError> {
        let raw = with_retry(&self.config.retry, "inspect", || self.inspect_once(handle)).await?;
        let health = match raw.state.health.as_ref().map(|h| h.status.as_str()) {
            None | Some("none") => HealthState::None,
            Some("healthy") => HealthState::Healthy,
            Some("unhealthy") => HealthState::Unhealthy,
            Some(_) => HealthState::Starting,
        };
        Ok(ContainerStatus {
            running: raw.state.running,
            health,
            endpoint: self.endpoint_of(&raw),
        })
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let grace = self.config.stop_grace_secs.to_string();
        let stop_path = with_query(
            &format!("/containers/{}/stop", handle.id()),
            &[("t", &grace)],
        )?;
        let remove_path = with_query(
            &format!("/containers/{}", handle.id()),
            &[("force", "true")],
        )?;

        with_retry(&self.config.retry, "stop_container", || async {
            let (status, resp) = self.call(Method::POST, &stop_path, None).await?;
            match status {
                s if s.is_success() => Ok(()),
                StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(()),
                s => Err(classify(s, &resp, handle.id())),
            }
        })
        .await?;

        with_retry(&self.config.retry, "remove_container", || async {
            let (status, resp) = self.call(Method::DELETE, &remove_path, None).await?;
            match status {
                s if s.is_success() => Ok(()),
                StatusCode::NOT_FOUND => Ok(()),
                s => Err(classify(s, &resp, handle.id())),
            }
        })
        .await?;

        info!(container = %handle, "Container stopped and removed");
        Ok(())
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError> {
        let path = with_query(
            &format!("/containers/{}/stats", handle.id()),
            &[("stream", "false")],
        )?;
        let raw: RawStats = with_retry(&self.config.retry, "stats", || async {
            let (status, body) = self.call(Method::GET, &path, None).await?;
            if !status.is_success() {
                return Err(classify(status, &body, handle.id()));
            }
            serde_json::from_slice(&body)
                .map_err(|e| RuntimeError::Permanent(format!("decode stats: {e}")))
        })
        .await?;
        Ok(compute_stats(&raw))
    }
}

/// Append url-encoded query parameters to an API path.
fn with_query(path: &str, params: &[(&str, &str)]) -> Result<String, RuntimeError> {
    let mut url = reqwest::Url::parse(&format!("http://docker{path}"))
        .map_err(|e| RuntimeError::Permanent(format!("invalid API path {path}: {e}")))?;
    if params.is_empty() {
        return Ok(url.path().to_string());
    }
    url.query_pairs_mut().extend_pairs(params);
    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// Docker tags allow `[A-Za-z0-9_.-]`, at most 128 chars.
fn sanitize_tag(version: &str) -> String {
    let tag: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(128)
        .collect();
    if tag.is_empty() {
        "latest".to_string()
    } else {
        tag
    }
}

fn engine_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct EngineError {
        message: String,
    }
    serde_json::from_slice::<EngineError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

fn classify(status: StatusCode, body: &[u8], target: &str) -> RuntimeError {
    let message = engine_message(body);
    if status == StatusCode::NOT_FOUND {
        RuntimeError::NotFound(target.to_string())
    } else if status.is_server_error() {
        RuntimeError::Transient(format!("{target}: {status}: {message}"))
    } else {
        RuntimeError::Permanent(format!("{target}: {status}: {message}"))
    }
}

/// The build endpoint streams JSON progress objects and reports failures
/// in-band with an `error` field.
fn build_stream_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Progress {
        #[serde(default)]
        error: Option<String>,
    }
    serde_json::Deserializer::from_slice(body)
        .into_iter::<Progress>()
        .filter_map(Result::ok)
        .find_map(|p| p.error)
}

#[derive(Debug, Deserialize)]
struct CreatedContainer {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    state: RawState,
    #[serde(default)]
    network_settings: RawNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    health: Option<RawHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHealth {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetworkSettings {
    #[serde(default)]
    networks: BTreeMap<String, RawEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    cpu_stats: RawCpuStats,
    #[serde(default)]
    precpu_stats: RawCpuStats,
    #[serde(default)]
    memory_stats: RawMemoryStats,
    #[serde(default)]
    networks: BTreeMap<String, RawNetworkStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuStats {
    #[serde(default)]
    cpu_usage: RawCpuUsage,
    #[serde(default)]
    system_cpu_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemoryStats {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

/// CPU percent is the container's share of host CPU time between the two
/// samples the engine returns.
fn compute_stats(raw: &RawStats) -> ContainerStats {
    let cpu_delta = raw
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(raw.precpu_stats.cpu_usage.total_usage);
    let system_delta = raw
        .cpu_stats
        .system_cpu_usage
        .saturating_sub(raw.precpu_stats.system_cpu_usage);
    let cpu_percent = if system_delta > 0 {
        cpu_delta as f64 / system_delta as f64 * 100.0
    } else {
        0.0
    };

    let (rx, tx) = raw
        .networks
        .values()
        .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

    ContainerStats {
        cpu_percent,
        memory_mb: raw.memory_stats.usage as f64 / MIB as f64,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query_encodes_values() {
        let path = with_query(
            "/build",
            &[("t", "quark-app-x:v1"), ("remote", "https://github.com/a/b#abc")],
        )
        .unwrap();
        assert_eq!(
            path,
            "/build?t=quark-app-x%3Av1&remote=https%3A%2F%2Fgithub.com%2Fa%2Fb%23abc"
        );
    }

    #[test]
    fn test_with_query_leaves_bare_path_without_params() {
        assert_eq!(with_query("/info", &[]).unwrap(), "/info");
        assert_eq!(
            with_query("/containers/quark-web-1/json", &[]).unwrap(),
            "/containers/quark-web-1/json"
        );
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("v1.2.3"), "v1.2.3");
        assert_eq!(sanitize_tag("feature/login"), "feature-login");
        assert_eq!(sanitize_tag(""), "latest");
        assert_eq!(sanitize_tag(&"a".repeat(200)).len(), 128);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify(StatusCode::NOT_FOUND, b"{}", "c1").is_not_found());
        assert!(classify(
            StatusCode::INTERNAL_SERVER_ERROR,
            br#"{"message":"boom"}"#,
            "c1"
        )
        .is_transient());
        let err = classify(StatusCode::CONFLICT, br#"{"message":"name in use"}"#, "c1");
        assert_eq!(err, RuntimeError::Permanent("c1: 409 Conflict: name in use".into()));
    }

    #[test]
    fn test_build_stream_error_detected() {
        let body = br#"{"stream":"Step 1/3 : FROM python:3.12"}
{"stream":"\n"}
{"errorDetail":{"message":"no such file"},"error":"no such file"}
"#;
        assert_eq!(build_stream_error(body).as_deref(), Some("no such file"));
        assert_eq!(build_stream_error(br#"{"stream":"ok"}"#), None);
    }

    #[test]
    fn test_compute_stats() {
        let raw: RawStats = serde_json::from_value(json!({
            "cpu_stats": { "cpu_usage": { "total_usage": 300 }, "system_cpu_usage": 2000 },
            "precpu_stats": { "cpu_usage": { "total_usage": 100 }, "system_cpu_usage": 1000 },
            "memory_stats": { "usage": 64 * MIB },
            "networks": {
                "eth0": { "rx_bytes": 10, "tx_bytes": 20 },
                "eth1": { "rx_bytes": 1, "tx_bytes": 2 }
            }
        }))
        .unwrap();
        let stats = compute_stats(&raw);
        assert!((stats.cpu_percent - 20.0).abs() < f64::EPSILON);
        assert!((stats.memory_mb - 64.0).abs() < f64::EPSILON);
        assert_eq!(stats.network_rx_bytes, 11);
        assert_eq!(stats.network_tx_bytes, 22);
    }

    #[test]
    fn test_compute_stats_first_sample_has_no_cpu() {
        let stats = compute_stats(&RawStats::default());
        assert_eq!(stats.cpu_percent, 0.0);
    }

    #[test]
    fn test_inspect_parsing_and_endpoint() {
        let raw: RawInspect = serde_json::from_value(json!({
            "State": { "Running": true, "Health": { "Status": "starting" } },
            "NetworkSettings": { "Networks": { "bridge": { "IPAddress": "172.17.0.5" } } }
        }))
        .unwrap();
        assert!(raw.state.running);

        let runtime = DockerRuntime::new(DockerConfig::default());
        assert_eq!(runtime.endpoint_of(&raw).as_deref(), Some("172.17.0.5:8000"));

        let scoped = DockerRuntime::new(DockerConfig {
            network: Some("quark".into()),
            ..DockerConfig::default()
        });
        assert_eq!(scoped.endpoint_of(&raw), None);
    }
}
