//! shelver.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "shelver.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV_VAR: &str = "SHELVER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShelverConfig {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
    pub readiness: ReadinessConfig,
    pub idle: IdleConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Compute-plane name of the managed instance.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeConfig {
    /// CLI used to drive the compute plane.
    #[serde(default = "default_compute_program")]
    pub program: String,
    /// Global arguments prepended to every invocation (e.g. `--os-cloud`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Bound on start and shelve calls.
    #[serde(default = "default_compute_timeout", with = "serde_str")]
    pub timeout: Duration,
    /// Bound on status queries.
    #[serde(default = "default_status_timeout", with = "serde_str")]
    pub status_timeout: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            program: default_compute_program(),
            args: Vec::new(),
            timeout: default_compute_timeout(),
            status_timeout: default_status_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Health endpoint of the managed workload.
    pub url: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_probe_interval", with = "serde_str")]
    pub interval: Duration,
    /// Overall deadline for one unshelve episode.
    #[serde(default = "default_probe_deadline", with = "serde_str")]
    pub deadline: Duration,
    #[serde(default = "default_attempt_timeout", with = "serde_str")]
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdleConfig {
    /// Reverse-proxy JSON access log.
    pub access_log: PathBuf,
    /// Upstream name whose requests count as traffic for the instance.
    pub upstream_label: String,
    #[serde(default = "default_idle_timeout", with = "serde_str")]
    pub timeout: Duration,
    #[serde(default = "default_poll_interval", with = "serde_str")]
    pub poll_interval: Duration,
    #[serde(default = "default_rotation_grace", with = "serde_str")]
    pub rotation_grace: Duration,
    /// Lead time before the idle timeout at which `IdleCountdown` begins.
    #[serde(default, with = "serde_str::option")]
    pub warning: Option<Duration>,
    /// Response codes that do not count as traffic.
    #[serde(default)]
    pub ignore_statuses: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval", with = "serde_str")]
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Active local audit log; rotated siblings get `.1`, `.2`, ...
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// Events kept in memory for the status view.
    #[serde(default = "default_recent")]
    pub recent: usize,
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            max_bytes: default_max_bytes(),
            max_files: default_max_files(),
            recent: default_recent(),
            mirror: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    /// HTTP PUT to `{endpoint}/{container}/{key}` (Swift-compatible).
    Http,
    /// Files under a local (typically network-mounted) directory.
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub kind: MirrorKind,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the auth token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_mirror_timeout", with = "serde_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ShelverConfig {
    /// Load from `path`, or `$SHELVER_CONFIG`, or `shelver.toml`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        Self::from_file(&resolved)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ShelverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the background loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.id.trim().is_empty() {
            return Err(invalid("instance.id must not be empty"));
        }
        if self.idle.upstream_label.trim().is_empty() {
            return Err(invalid("idle.upstream_label must not be empty"));
        }

        let durations = [
            ("compute.timeout", self.compute.timeout),
            ("compute.status_timeout", self.compute.status_timeout),
            ("readiness.interval", self.readiness.interval),
            ("readiness.deadline", self.readiness.deadline),
            ("readiness.attempt_timeout", self.readiness.attempt_timeout),
            ("idle.timeout", self.idle.timeout),
            ("idle.poll_interval", self.idle.poll_interval),
            ("reconcile.interval", self.reconcile.interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(invalid(&format!("{name} must be greater than zero")));
            }
        }

        if self.readiness.deadline < self.readiness.interval {
            return Err(invalid("readiness.deadline must be at least readiness.interval"));
        }
        if let Some(warning) = self.idle.warning
            && (warning.is_zero() || warning >= self.idle.timeout)
        {
            return Err(invalid("idle.warning must be between zero and idle.timeout"));
        }
        if self.audit.max_files == 0 {
            return Err(invalid("audit.max_files must be at least 1"));
        }
        if self.audit.max_bytes == 0 {
            return Err(invalid("audit.max_bytes must be greater than zero"));
        }

        if let Some(mirror) = &self.audit.mirror {
            match mirror.kind {
                MirrorKind::Http => {
                    if mirror.endpoint.as_deref().is_none_or(str::is_empty) {
                        return Err(invalid("audit.mirror.endpoint is required for kind = \"http\""));
                    }
                    if mirror.container.is_empty() {
                        return Err(invalid("audit.mirror.container must not be empty"));
                    }
                }
                MirrorKind::Directory => {
                    if mirror.directory.is_none() {
                        return Err(invalid(
                            "audit.mirror.directory is required for kind = \"directory\"",
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

fn default_true() -> bool {
    true
}

fn default_compute_program() -> String {
    "openstack".to_string()
}

fn default_compute_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_status_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_probe_deadline() -> Duration {
    Duration::from_secs(600)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_rotation_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("/var/lib/shelver/events.jsonl")
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_files() -> u32 {
    5
}

fn default_recent() -> usize {
    50
}

fn default_container() -> String {
    "shelver-events".to_string()
}

fn default_mirror_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/shelver/state.redb")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[instance]
id = "gpu-worker"

[readiness]
url = "https://gpu.example.org/health"

[idle]
access_log = "/var/log/caddy/access.json"
upstream_label = "gpu"
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = ShelverConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.instance.id, "gpu-worker");
        assert_eq!(config.compute.program, "openstack");
        assert_eq!(config.readiness.interval, Duration::from_secs(2));
        assert!(config.readiness.verify_tls);
        assert_eq!(config.idle.timeout, Duration::from_secs(1800));
        assert_eq!(config.idle.rotation_grace, Duration::from_secs(120));
        assert_eq!(config.idle.warning, None);
        assert_eq!(config.reconcile.interval, Duration::from_secs(60));
        assert_eq!(config.audit.max_files, 5);
        assert!(config.audit.mirror.is_none());
        assert_eq!(config.api.listen.port(), 8080);
    }

    #[test]
    fn parse_full_document() {
        let toml_str = r#"
[instance]
id = "gpu-worker"

[compute]
program = "/usr/bin/openstack"
args = ["--os-cloud", "gpu"]
timeout = "15m"
status_timeout = "20s"

[readiness]
url = "https://10.0.0.5:8443/health"
verify_tls = false
interval = "3s"
deadline = "5m"
attempt_timeout = "2s"

[idle]
access_log = "/var/log/caddy/access.json"
upstream_label = "gpu"
timeout = "45m"
poll_interval = "5s"
rotation_grace = "90s"
warning = "5m"
ignore_statuses = [502, 503]

[reconcile]
interval = "2m"

[audit]
path = "/tmp/events.jsonl"
max_bytes = 4096
max_files = 3
recent = 10

[audit.mirror]
kind = "http"
container = "gpu-events"
prefix = "prod"
endpoint = "https://swift.example.org/v1/AUTH_abc"
token_env = "SWIFT_TOKEN"

[state]
path = "/tmp/state.redb"

[api]
listen = "0.0.0.0:9000"
"#;
        let config = ShelverConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.compute.args, vec!["--os-cloud", "gpu"]);
        assert_eq!(config.compute.timeout, Duration::from_secs(900));
        assert!(!config.readiness.verify_tls);
        assert_eq!(config.idle.warning, Some(Duration::from_secs(300)));
        assert_eq!(config.idle.ignore_statuses, vec![502, 503]);
        let mirror = config.audit.mirror.unwrap();
        assert_eq!(mirror.kind, MirrorKind::Http);
        assert_eq!(mirror.container, "gpu-events");
        assert_eq!(mirror.timeout, Duration::from_secs(30));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ShelverConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = ShelverConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.idle.timeout, config.idle.timeout);
        assert_eq!(reparsed.readiness.url, config.readiness.url);
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml_str = format!("{MINIMAL}\n[extra]\nfoo = 1\n");
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = MINIMAL.replace(
            "upstream_label = \"gpu\"",
            "upstream_label = \"gpu\"\ntimeout = \"forever\"",
        );
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_empty_upstream_label() {
        let toml_str = MINIMAL.replace("upstream_label = \"gpu\"", "upstream_label = \" \"");
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_deadline_shorter_than_interval() {
        let toml_str = MINIMAL.replace(
            "url = \"https://gpu.example.org/health\"",
            "url = \"https://gpu.example.org/health\"\ninterval = \"10s\"\ndeadline = \"5s\"",
        );
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_warning_not_below_timeout() {
        let toml_str = MINIMAL.replace(
            "upstream_label = \"gpu\"",
            "upstream_label = \"gpu\"\ntimeout = \"10m\"\nwarning = \"10m\"",
        );
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_http_mirror_without_endpoint() {
        let toml_str = format!("{MINIMAL}\n[audit.mirror]\nkind = \"http\"\n");
        assert!(matches!(
            ShelverConfig::from_toml(&toml_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShelverConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelver.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = ShelverConfig::load(Some(&path)).unwrap();
        assert_eq!(config.idle.upstream_label, "gpu");
    }
}
