//! Configuration for the RunWave server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use runwave_core::{CommandTemplate, CoreError, PodLabels, ServiceConfig, DEFAULT_NAMESPACE};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum size of submitted code in bytes (1 MiB).
pub const DEFAULT_MAX_CODE_BYTES: usize = 1024 * 1024;

/// Default language table.
pub const DEFAULT_LANGUAGES: &str = "python=python -c;javascript=node -e";

/// Configuration for the RunWave server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Namespace holding the sandbox pods.
    pub namespace: String,

    /// kubectl binary (name on `PATH` or absolute path).
    pub kubectl: PathBuf,

    /// Kubeconfig passed to kubectl; kubectl's own default when unset.
    pub kubeconfig: Option<PathBuf>,

    /// Language identifier to command template.
    pub languages: BTreeMap<String, CommandTemplate>,

    /// Claim attempts per request (default: 4).
    pub claim_retries: u32,

    /// Backoff unit between claim attempts (default: 1s).
    pub retry_backoff: Duration,

    /// Execution deadline (default: 6s).
    pub timeout: Duration,

    /// Label keys and role values.
    pub labels: PodLabels,

    /// Largest accepted `code` field in bytes (default: 1 MiB).
    pub max_code_bytes: usize,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no languages configured")]
    NoLanguages,

    #[error("kubectl binary not found: {0}")]
    MissingKubectl(PathBuf),

    #[error("kubeconfig not found: {0}")]
    MissingKubeconfig(PathBuf),

    #[error("invalid service configuration: {0}")]
    Service(#[from] CoreError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        let service = ServiceConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            namespace: DEFAULT_NAMESPACE.into(),
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
            languages: service.commands,
            claim_retries: service.claim_retries,
            retry_backoff: service.retry_backoff,
            timeout: service.timeout,
            labels: service.labels,
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
        }
    }
}

/// Parse a language table of the form `lang=command words;lang=...`.
///
/// Malformed entries are skipped.
pub fn parse_languages(table: &str) -> BTreeMap<String, CommandTemplate> {
    table
        .split(';')
        .filter_map(|entry| {
            let (language, command) = entry.split_once('=')?;
            let language = language.trim();
            let template = CommandTemplate::parse(command);
            (!language.is_empty() && !template.is_empty())
                .then(|| (language.to_owned(), template))
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `RUNWAVE_HTTP_HOST` | `0.0.0.0` |
    /// | `RUNWAVE_HTTP_PORT` | `8080` |
    /// | `RUNWAVE_NAMESPACE` | `code-exec-system` |
    /// | `RUNWAVE_KUBECTL` | `kubectl` |
    /// | `RUNWAVE_KUBECONFIG` | unset |
    /// | `RUNWAVE_LANGUAGES` | `python=python -c;javascript=node -e` |
    /// | `RUNWAVE_CLAIM_RETRIES` | `4` |
    /// | `RUNWAVE_RETRY_BACKOFF_MS` | `1000` |
    /// | `RUNWAVE_TIMEOUT_MS` | `6000` |
    /// | `RUNWAVE_ROLE_LABEL` | `app` |
    /// | `RUNWAVE_STANDBY_ROLE` | `standby-pod` |
    /// | `RUNWAVE_IN_USE_ROLE` | `in-use-pod` |
    /// | `RUNWAVE_LANGUAGE_LABEL` | `language` |
    /// | `RUNWAVE_MAX_CODE_BYTES` | `1048576` |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr =
            env_parse("RUNWAVE_HTTP_HOST").unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        let http_port: u16 = env_parse("RUNWAVE_HTTP_PORT").unwrap_or(default.http_addr.port());

        let languages = std::env::var("RUNWAVE_LANGUAGES")
            .map(|v| parse_languages(&v))
            .ok()
            .filter(|table| !table.is_empty())
            .unwrap_or(default.languages);

        let labels = PodLabels {
            language_key: env_string("RUNWAVE_LANGUAGE_LABEL")
                .unwrap_or(default.labels.language_key),
            role_key: env_string("RUNWAVE_ROLE_LABEL").unwrap_or(default.labels.role_key),
            standby_role: env_string("RUNWAVE_STANDBY_ROLE")
                .unwrap_or(default.labels.standby_role),
            in_use_role: env_string("RUNWAVE_IN_USE_ROLE").unwrap_or(default.labels.in_use_role),
        };

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            namespace: env_string("RUNWAVE_NAMESPACE").unwrap_or(default.namespace),
            kubectl: env_string("RUNWAVE_KUBECTL")
                .map(PathBuf::from)
                .unwrap_or(default.kubectl),
            kubeconfig: env_string("RUNWAVE_KUBECONFIG").map(PathBuf::from),
            languages,
            claim_retries: env_parse("RUNWAVE_CLAIM_RETRIES").unwrap_or(default.claim_retries),
            retry_backoff: env_parse("RUNWAVE_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.retry_backoff),
            timeout: env_parse("RUNWAVE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.timeout),
            labels,
            max_code_bytes: env_parse("RUNWAVE_MAX_CODE_BYTES").unwrap_or(default.max_code_bytes),
        }
    }

    /// Build the scheduler configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Service`] if the values do not form a valid
    /// [`ServiceConfig`].
    pub fn to_service_config(&self) -> Result<ServiceConfig, ConfigError> {
        let config = ServiceConfig::builder()
            .namespace(&self.namespace)
            .commands(self.languages.clone())
            .claim_retries(self.claim_retries)
            .retry_backoff(self.retry_backoff)
            .timeout(self.timeout)
            .labels(self.labels.clone())
            .build()?;
        Ok(config)
    }

    /// Validate the configuration, including the kubectl paths.
    ///
    /// A bare `kubectl` name is resolved through `PATH` at spawn time and is
    /// not checked here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.languages.is_empty() {
            return Err(ConfigError::NoLanguages);
        }

        if self.kubectl.components().count() > 1 && !self.kubectl.exists() {
            return Err(ConfigError::MissingKubectl(self.kubectl.clone()));
        }

        if let Some(kubeconfig) = &self.kubeconfig {
            if !kubeconfig.exists() {
                return Err(ConfigError::MissingKubeconfig(kubeconfig.clone()));
            }
        }

        self.to_service_config()?;
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Suspicious configuration");
        }
        if self.timeout > Duration::from_secs(60) {
            tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Execution timeout is unusually long");
        }
    }
}
