//! Server configuration parsing.
//!
//! ```kdl
//! server listen="0.0.0.0:3000" log-format="json" log-level="info"
//! storage {
//!     jobs "postgres" url="postgres://kiln@localhost/kiln"
//!     logs "file" path="/var/lib/kiln/logs"
//! }
//! executor "kubernetes" namespace="ci" {
//!     profile "default" cpu="1" memory="2Gi"
//! }
//! cutter marker="^=== ([A-Za-z0-9_.-]+) ===$" default-segment="default"
//! jobs max-duration-secs=3600 cancel-grace-secs=30 subscriber-buffer=256
//! retry max-retries=5 base-delay-ms=200 max-delay-ms=10000 multiplier=2.0
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use kiln_core::RetryPolicy;
use kiln_core::executor::ResourceProfile;
use kiln_core::logcutter::{Cutter, DEFAULT_MARKER, DEFAULT_SEGMENT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerSettings,
    pub storage: StorageConfig,
    pub executor: ExecutorConfig,
    pub cutter: CutterConfig,
    pub jobs: JobSettings,
    /// Backoff for transient scheduler and store errors.
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub log_format: LogFormat,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log_format: LogFormat::Text,
            log_level: "info".to_string(),
        }
    }
}

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    File { path: PathBuf },
    Postgres { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub jobs: StorageBackend,
    pub logs: StorageBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ExecutorBackend {
    Kubernetes {
        namespace: String,
        /// Uses in-cluster configuration or the default kubeconfig when unset.
        kubeconfig: Option<PathBuf>,
    },
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub backend: ExecutorBackend,
    pub profiles: BTreeMap<String, ResourceProfile>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::Kubernetes {
                namespace: "default".to_string(),
                kubeconfig: None,
            },
            profiles: default_profiles(),
        }
    }
}

fn default_profiles() -> BTreeMap<String, ResourceProfile> {
    BTreeMap::from([("default".to_string(), ResourceProfile::default())])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutterConfig {
    pub marker: String,
    pub default_segment: String,
}

impl Default for CutterConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            default_segment: DEFAULT_SEGMENT.to_string(),
        }
    }
}

impl CutterConfig {
    pub fn build(&self) -> ConfigResult<Cutter> {
        Cutter::new(&self.marker, self.default_segment.clone())
            .map_err(|e| ConfigError::invalid("cutter", e.to_string()))
    }
}

/// Limits applied to every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Jobs running longer are aborted, unless their spec sets a timeout.
    pub max_duration: Duration,
    /// How long a cancellation may take before it is forced.
    pub cancel_grace: Duration,
    /// Updates buffered per job before slow subscribers start losing them.
    pub subscriber_buffer: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
            subscriber_buffer: 256,
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut server = ServerSettings::default();
    let mut storage = None;
    let mut executor = ExecutorConfig::default();
    let mut cutter = CutterConfig::default();
    let mut jobs = JobSettings::default();
    let mut retry = RetryPolicy::default();

    let mut seen = HashSet::new();
    for node in doc.nodes() {
        let section = node.name().value();
        if !seen.insert(section.to_string()) {
            return Err(ConfigError::Duplicate(format!("section '{}'", section)));
        }
        match section {
            "server" => server = parse_server(node)?,
            "storage" => storage = Some(parse_storage(node)?),
            "executor" => executor = parse_executor(node)?,
            "cutter" => cutter = parse_cutter(node),
            "jobs" => jobs = parse_jobs(node)?,
            "retry" => retry = parse_retry(node)?,
            other => {
                return Err(ConfigError::invalid(
                    "section",
                    format!("unknown section '{}'", other),
                ));
            }
        }
    }

    let storage = storage.ok_or_else(|| ConfigError::MissingField("storage".to_string()))?;

    cutter.build()?;
    retry
        .validate()
        .map_err(|message| ConfigError::invalid("retry", message))?;

    Ok(SystemConfig {
        server,
        storage,
        executor,
        cutter,
        jobs,
        retry,
    })
}

fn parse_server(node: &KdlNode) -> ConfigResult<ServerSettings> {
    let mut server = ServerSettings::default();

    if let Some(listen) = get_string_prop(node, "listen") {
        server.listen = listen
            .parse()
            .map_err(|e| ConfigError::invalid("server.listen", format!("{}: {}", listen, e)))?;
    }
    if let Some(format) = get_string_prop(node, "log-format") {
        server.log_format = match format.as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::invalid(
                    "server.log-format",
                    format!("expected 'text' or 'json', got '{}'", other),
                ));
            }
        };
    }
    if let Some(level) = get_string_prop(node, "log-level") {
        server.log_level = level;
    }
    Ok(server)
}

fn parse_storage(node: &KdlNode) -> ConfigResult<StorageConfig> {
    let mut jobs = None;
    let mut logs = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "jobs" => jobs = Some(parse_backend(child, "storage.jobs")?),
                "logs" => logs = Some(parse_backend(child, "storage.logs")?),
                other => {
                    return Err(ConfigError::invalid(
                        "storage",
                        format!("unknown store '{}'", other),
                    ));
                }
            }
        }
    }

    Ok(StorageConfig {
        jobs: jobs.ok_or_else(|| ConfigError::MissingField("storage.jobs".to_string()))?,
        logs: logs.ok_or_else(|| ConfigError::MissingField("storage.logs".to_string()))?,
    })
}

fn parse_backend(node: &KdlNode, field: &str) -> ConfigResult<StorageBackend> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} backend", field)))?;

    match kind.as_str() {
        "file" => {
            let path = get_string_prop(node, "path")
                .ok_or_else(|| ConfigError::MissingField(format!("{} path", field)))?;
            Ok(StorageBackend::File { path: path.into() })
        }
        "postgres" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField(format!("{} url", field)))?;
            Ok(StorageBackend::Postgres { url })
        }
        other => Err(ConfigError::invalid(
            field,
            format!("unknown backend '{}', expected 'file' or 'postgres'", other),
        )),
    }
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("executor backend".to_string()))?;

    let backend = match kind.as_str() {
        "kubernetes" => ExecutorBackend::Kubernetes {
            namespace: get_string_prop(node, "namespace")
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            kubeconfig: get_string_prop(node, "kubeconfig").map(PathBuf::from),
        },
        "docker" => ExecutorBackend::Docker,
        other => {
            return Err(ConfigError::invalid(
                "executor",
                format!("unknown backend '{}', expected 'kubernetes' or 'docker'", other),
            ));
        }
    };

    let mut profiles = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "profile" {
                continue;
            }
            let name = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("profile name".to_string()))?;
            let profile = ResourceProfile {
                cpu_request: get_string_prop(child, "cpu"),
                memory_request: get_string_prop(child, "memory"),
                cpu_limit: get_string_prop(child, "cpu-limit"),
                memory_limit: get_string_prop(child, "memory-limit"),
            };
            if profiles.insert(name.clone(), profile).is_some() {
                return Err(ConfigError::Duplicate(format!("profile '{}'", name)));
            }
        }
    }
    if profiles.is_empty() {
        profiles = default_profiles();
    }

    Ok(ExecutorConfig { backend, profiles })
}

fn parse_cutter(node: &KdlNode) -> CutterConfig {
    let defaults = CutterConfig::default();
    CutterConfig {
        marker: get_string_prop(node, "marker").unwrap_or(defaults.marker),
        default_segment: get_string_prop(node, "default-segment")
            .unwrap_or(defaults.default_segment),
    }
}

fn parse_jobs(node: &KdlNode) -> ConfigResult<JobSettings> {
    let mut jobs = JobSettings::default();

    if let Some(secs) = get_u64_prop(node, "max-duration-secs")? {
        jobs.max_duration = positive_secs("jobs.max-duration-secs", secs)?;
    }
    if let Some(secs) = get_u64_prop(node, "cancel-grace-secs")? {
        jobs.cancel_grace = positive_secs("jobs.cancel-grace-secs", secs)?;
    }
    if let Some(size) = get_u64_prop(node, "subscriber-buffer")? {
        if size == 0 {
            return Err(ConfigError::invalid("jobs.subscriber-buffer", "must be positive"));
        }
        jobs.subscriber_buffer = size as usize;
    }
    Ok(jobs)
}

fn positive_secs(field: &str, secs: u64) -> ConfigResult<Duration> {
    if secs == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetryPolicy> {
    let mut retry = RetryPolicy::default();

    if let Some(n) = get_u64_prop(node, "max-retries")? {
        retry.max_retries = u32::try_from(n)
            .map_err(|_| ConfigError::invalid("retry.max-retries", "out of range"))?;
    }
    if let Some(ms) = get_u64_prop(node, "base-delay-ms")? {
        retry.base_delay_ms = ms;
    }
    if let Some(ms) = get_u64_prop(node, "max-delay-ms")? {
        retry.max_delay_ms = ms;
    }
    if let Some(value) = node.get("multiplier") {
        retry.multiplier = value_as_f64(value)
            .ok_or_else(|| ConfigError::invalid("retry.multiplier", "expected a number"))?;
    }
    Ok(retry)
}

// Helpers for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, "expected a non-negative integer")),
    }
}

fn value_as_f64(value: &KdlValue) -> Option<f64> {
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}
