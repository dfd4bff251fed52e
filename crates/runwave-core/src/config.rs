//! Service configuration types.

use crate::error::CoreError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Default namespace holding the sandbox pods.
pub const DEFAULT_NAMESPACE: &str = "code-exec-system";

/// Shell invocation used to run code for one language.
///
/// The template is an argument vector; the submitted code is appended as
/// the final argument, so it is never interpreted by a shell on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(Vec<String>);

impl CommandTemplate {
    /// Parse a template from whitespace-separated words (`"python -c"`).
    pub fn parse(template: &str) -> Self {
        Self(template.split_whitespace().map(str::to_owned).collect())
    }

    /// Whether the template has no words.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Template words.
    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Build the full argument vector for `code`.
    pub fn to_argv(&self, code: &str) -> Vec<String> {
        let mut argv = self.0.clone();
        argv.push(code.to_owned());
        argv
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// Label keys and role values observed on sandbox pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLabels {
    /// Key of the immutable language label (default: `language`).
    pub language_key: String,
    /// Key of the mutable role label (default: `app`).
    pub role_key: String,
    /// Role value of an idle pod (default: `standby-pod`).
    pub standby_role: String,
    /// Role value of a claimed pod (default: `in-use-pod`).
    pub in_use_role: String,
}

impl Default for PodLabels {
    fn default() -> Self {
        Self {
            language_key: "language".into(),
            role_key: "app".into(),
            standby_role: "standby-pod".into(),
            in_use_role: "in-use-pod".into(),
        }
    }
}

/// Immutable configuration shared by every scheduler component.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Namespace the sandbox pods live in.
    pub namespace: String,
    /// Language identifier to command template.
    pub commands: BTreeMap<String, CommandTemplate>,
    /// Maximum claim attempts per request (default: 4).
    pub claim_retries: u32,
    /// Backoff unit between claim attempts; attempt `n` sleeps `n` units (default: 1s).
    pub retry_backoff: Duration,
    /// Deadline for one remote execution (default: 6s).
    pub timeout: Duration,
    /// Label keys and role values.
    pub labels: PodLabels,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert("python".to_owned(), CommandTemplate::parse("python -c"));
        commands.insert("javascript".to_owned(), CommandTemplate::parse("node -e"));

        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            commands,
            claim_retries: 4,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(6),
            labels: PodLabels::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new config builder seeded with the defaults.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Look up the command template for a language.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedLanguage`] if the language is unknown
    /// or its template is empty.
    pub fn command_for(&self, language: &str) -> Result<&CommandTemplate, CoreError> {
        match self.commands.get(language) {
            Some(template) if !template.is_empty() => Ok(template),
            _ => Err(CoreError::UnsupportedLanguage(language.to_owned())),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.namespace.trim().is_empty() {
            return Err(CoreError::Config("namespace is required".into()));
        }
        if self.commands.is_empty() {
            return Err(CoreError::Config(
                "at least one language must be configured".into(),
            ));
        }
        if let Some((lang, _)) = self.commands.iter().find(|(_, t)| t.is_empty()) {
            return Err(CoreError::Config(format!(
                "command template for {lang} is empty"
            )));
        }
        if self.claim_retries == 0 {
            return Err(CoreError::Config("claim_retries must be > 0".into()));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::Config("timeout must be > 0".into()));
        }
        if self.labels.standby_role == self.labels.in_use_role {
            return Err(CoreError::Config(
                "standby and in-use role values must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for ServiceConfig.
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Add or replace the command template for a language.
    pub fn command(mut self, language: impl Into<String>, template: &str) -> Self {
        self.config
            .commands
            .insert(language.into(), CommandTemplate::parse(template));
        self
    }

    /// Replace the whole language table.
    pub fn commands(mut self, commands: BTreeMap<String, CommandTemplate>) -> Self {
        self.config.commands = commands;
        self
    }

    /// Set the maximum number of claim attempts.
    pub fn claim_retries(mut self, retries: u32) -> Self {
        self.config.claim_retries = retries;
        self
    }

    /// Set the backoff unit between claim attempts.
    pub fn retry_backoff(mut self, unit: Duration) -> Self {
        self.config.retry_backoff = unit;
        self
    }

    /// Set the execution deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set label keys and role values.
    pub fn labels(mut self, labels: PodLabels) -> Self {
        self.config.labels = labels;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ServiceConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
