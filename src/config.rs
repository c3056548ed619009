//! Configuration loading and validation.
//!
//! Values come from a JSON file (by default `config/main.json`) layered with
//! `KILN__*` environment variables, e.g. `KILN__PORT=8080`. A missing file or
//! a missing required key aborts boot.
//!
//! ```json
//! {
//!   "host": "0.0.0.0",
//!   "port": 8080,
//!   "env": "prod",
//!   "validation_host": "http://accounts:9010",
//!   "whitelist": [{ "path": "/public/*", "method": "get" }],
//!   "track": "UA-000000-1",
//!   "registration": { "host": "consul:8500", "token": "…", "checks": [] },
//!   "redis": "redis://secret@cache:6379/svc",
//!   "mongo": "mongodb://store:27017/svc",
//!   "sentry": "https://key@sentry.example/1"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;
use crate::method::Method;

/// Prefix of environment overrides (`KILN__PORT`, `KILN__ENV`, ...).
pub const ENV_PREFIX: &str = "KILN";

/// Default location of the main configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/main.json";

/// Default location of the optional permission-node manifest.
pub const DEFAULT_PERM_NODES_PATH: &str = "permNodes.json";

/// Timeout applied to every outbound call (account validation, analytics,
/// and the discovery agent unless `registration.timeout_ms` says otherwise).
pub const DEFAULT_OUTBOUND_TIMEOUT_MS: u64 = 5_000;

/// Largest request body the listener buffers; bigger ones get a 413.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interface the listener binds. **Required.**
    pub host: String,

    /// Port the listener binds. `0` picks a free port. **Required.**
    pub port: u16,

    /// Deployment environment (`prod`, `staging`, ...). Part of the scope key.
    /// **Required.**
    pub env: String,

    /// Base URL of the account validation service.
    #[serde(default = "default_validation_host")]
    pub validation_host: String,

    /// `User-Agent` sent to the validation service. Defaults to
    /// `{name}-{env}`.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Paths that skip authentication.
    #[serde(default)]
    pub whitelist: Vec<WhitelistConfig>,

    /// Analytics property id. Tracking is off when absent.
    #[serde(default)]
    pub track: Option<String>,

    /// Discovery registration. Off when absent.
    #[serde(default)]
    pub registration: Option<RegistrationConfig>,

    /// Cache connection string. When present, connecting is mandatory.
    #[serde(default)]
    pub redis: Option<String>,

    /// Data-store connection string. When present, connecting is mandatory.
    #[serde(default)]
    pub mongo: Option<String>,

    /// Error-tracker DSN. Reporting is off when absent, empty, or when
    /// `env` is `development`.
    #[serde(default)]
    pub sentry: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// One whitelist entry as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistConfig {
    pub path: String,
    /// Lowercase method name; absent means every method.
    #[serde(default)]
    pub method: Option<String>,
}

impl WhitelistConfig {
    pub fn method(&self) -> Result<Method, Error> {
        match &self.method {
            None => Ok(Method::All),
            Some(m) => m.parse().map_err(|e| Error::InvalidConfig(format!("whitelist `{}`: {e}", self.path))),
        }
    }
}

/// Discovery agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Agent address, `host:port`.
    pub host: String,
    /// ACL token sent as `X-Consul-Token`.
    #[serde(default)]
    pub token: Option<String>,
    /// Health checks registered with the service, passed through verbatim.
    #[serde(default)]
    pub checks: Vec<serde_json::Value>,
    /// Per-call timeout towards the agent.
    #[serde(default = "default_outbound_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_validation_host() -> String {
    "http://localhost:9010".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}
fn default_outbound_timeout_ms() -> u64 {
    DEFAULT_OUTBOUND_TIMEOUT_MS
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Loads `path` (required) plus environment overrides, then validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is absent or unreadable, a required key
    /// is missing, or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let cfg = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json).required(true))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true))
            .build()?;

        let c: Config = cfg.try_deserialize()?;
        c.validate()?;
        Ok(c)
    }

    /// Minimal configuration, for tests and embedding.
    pub fn new(host: impl Into<String>, port: u16, env: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            env: env.into(),
            validation_host: default_validation_host(),
            user_agent: None,
            whitelist: Vec::new(),
            track: None,
            registration: None,
            redis: None,
            mongo: None,
            sentry: None,
            log_level: default_log_level(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<(), Error> {
        ensure_non_empty(&self.host, "host")?;
        ensure_non_empty(&self.env, "env")?;
        ensure_non_empty(&self.validation_host, "validation_host")?;
        for entry in &self.whitelist {
            ensure_non_empty(&entry.path, "whitelist.path")?;
            entry.method()?;
        }
        if let Some(reg) = &self.registration {
            ensure_non_empty(&reg.host, "registration.host")?;
        }
        for (name, value) in [("redis", &self.redis), ("mongo", &self.mongo)] {
            if let Some(url) = value {
                ensure_non_empty(url, name)?;
            }
        }
        if self.max_body_bytes == 0 {
            return Err(Error::InvalidConfig("max_body_bytes must be positive".into()));
        }
        Ok(())
    }

    /// The error-tracker DSN, if reporting applies to this environment.
    pub fn sentry_dsn(&self) -> Option<&str> {
        self.sentry
            .as_deref()
            .map(str::trim)
            .filter(|dsn| !dsn.is_empty() && self.env != "development")
    }

    /// The active registration settings, if registration is configured and
    /// enabled.
    pub fn registration(&self) -> Option<&RegistrationConfig> {
        self.registration.as_ref().filter(|r| r.enabled)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::InvalidConfig(format!("{name} is required and must not be empty")));
    }
    Ok(())
}

/// Where boot looks for its files.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub perm_nodes: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self { config: DEFAULT_CONFIG_PATH.into(), perm_nodes: DEFAULT_PERM_NODES_PATH.into() }
    }
}

/// Reads the optional permission-node manifest. Absence is not an error: it
/// only disables the `/permnode` route.
pub async fn load_perm_nodes(path: &Path) -> Option<serde_json::Value> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "no permission-node manifest, /permnode disabled");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(nodes) => Some(nodes),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable permission-node manifest, /permnode disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("kiln-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_validation_host(), "http://localhost:9010");
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn loads_minimal_file() {
        let path = temp_file(r#"{"host": "127.0.0.1", "port": 8080, "env": "prod"}"#);
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.env, "prod");
        assert!(cfg.registration().is_none());
        assert!(cfg.redis.is_none());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn loads_optional_sections() {
        let path = temp_file(r#"{
            "host": "0.0.0.0", "port": 0, "env": "dev",
            "whitelist": [{"path": "/public/*", "method": "get"}, {"path": "/status"}],
            "registration": {"host": "consul:8500", "token": "t", "checks": [{"http": "http://x/", "interval": "10s"}]},
            "track": "UA-1"
        }"#);
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.whitelist[0].method().unwrap(), Method::Get);
        assert_eq!(cfg.whitelist[1].method().unwrap(), Method::All);
        let reg = cfg.registration().unwrap();
        assert_eq!(reg.token.as_deref(), Some("t"));
        assert_eq!(reg.checks.len(), 1);
        assert_eq!(reg.timeout_ms, DEFAULT_OUTBOUND_TIMEOUT_MS);
        assert_eq!(cfg.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("kiln-definitely-missing.json");
        assert!(Config::load(path).is_err());
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let path = temp_file(r#"{"host": "127.0.0.1", "port": 8080}"#);
        assert!(Config::load(&path).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn validate_rejects_empty_env() {
        assert!(Config::new("127.0.0.1", 80, " ").validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_whitelist_method() {
        let mut cfg = Config::new("127.0.0.1", 80, "prod");
        cfg.whitelist.push(WhitelistConfig { path: "/x".into(), method: Some("fetch".into()) });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_registration_is_ignored() {
        let mut cfg = Config::new("127.0.0.1", 80, "prod");
        cfg.registration = Some(RegistrationConfig {
            enabled: false,
            host: "consul:8500".into(),
            token: None,
            checks: Vec::new(),
            timeout_ms: DEFAULT_OUTBOUND_TIMEOUT_MS,
        });
        assert!(cfg.registration().is_none());
    }

    #[test]
    fn sentry_is_skipped_in_development() {
        let mut cfg = Config::new("127.0.0.1", 80, "development");
        cfg.sentry = Some("https://key@sentry.local/1".into());
        assert_eq!(cfg.sentry_dsn(), None);
        cfg.env = "prod".into();
        assert_eq!(cfg.sentry_dsn(), Some("https://key@sentry.local/1"));
        cfg.sentry = Some("  ".into());
        assert_eq!(cfg.sentry_dsn(), None);
    }

    #[tokio::test]
    async fn absent_perm_nodes_degrade_to_none() {
        let path = std::env::temp_dir().join("kiln-no-perm-nodes.json");
        assert!(load_perm_nodes(&path).await.is_none());
    }
}
