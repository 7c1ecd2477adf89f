use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Per-run timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on script source size accepted by a sandbox.
pub const MAX_SOURCE_LEN: usize = 1024 * 1024;

/// Top-level runner configuration (`scriptbox.toml`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxOptions,
    #[serde(default)]
    pub js: JsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// Timing and scheduling policy of a sandbox.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SandboxOptions {
    /// Budget for a single run. Accepts milliseconds or "5s"-style strings.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Wall-clock budget for a whole batch, if any.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub total_timeout: Option<Duration>,
    /// Maximum number of runs in flight inside a batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Interpreter limits for the JavaScript backend.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct JsConfig {
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

/// Settings of the HTTP client capability.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Connector preset settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectorConfig {
    /// Payload fields exposed to scripts as top-level variables.
    #[serde(default = "default_payload_aliases")]
    pub payload_aliases: Vec<String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_concurrency() -> usize {
    1
}

fn default_loop_iteration_limit() -> u64 {
    10_000_000
}

fn default_recursion_limit() -> usize {
    512
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("scriptbox/{}", env!("CARGO_PKG_VERSION"))
}

fn default_payload_aliases() -> Vec<String> {
    [
        "user",
        "segments",
        "user_segments",
        "account_segments",
        "account",
        "changes",
        "events",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            total_timeout: None,
            concurrency: default_concurrency(),
        }
    }
}

impl Default for JsConfig {
    fn default() -> Self {
        Self {
            loop_iteration_limit: default_loop_iteration_limit(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            payload_aliases: default_payload_aliases(),
        }
    }
}

// ── Durations ────────────────────────────────────────────

/// A timeout as written by a host: milliseconds or a duration string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Millis(u64),
    Text(String),
}

impl DurationSpec {
    pub fn resolve(&self) -> Result<Duration, ConfigError> {
        match self {
            DurationSpec::Millis(ms) => Ok(Duration::from_millis(*ms)),
            DurationSpec::Text(text) => parse_duration(text),
        }
    }
}

impl From<u64> for DurationSpec {
    fn from(ms: u64) -> Self {
        DurationSpec::Millis(ms)
    }
}

impl From<&str> for DurationSpec {
    fn from(text: &str) -> Self {
        DurationSpec::Text(text.to_string())
    }
}

impl From<Duration> for DurationSpec {
    fn from(duration: Duration) -> Self {
        DurationSpec::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Parses "5s", "150ms", "1m 30s"; a bare number is read as milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let trimmed = text.trim();
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(trimmed).map_err(|e| ConfigError::InvalidDuration {
        value: text.to_string(),
        reason: e.to_string(),
    })
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationSpec::deserialize(deserializer)?
        .resolve()
        .map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<DurationSpec>::deserialize(deserializer)? {
        Some(duration) => duration.resolve().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

// ── SandboxOptions ───────────────────────────────────────

impl SandboxOptions {
    pub fn with_timeout(mut self, timeout: impl Into<DurationSpec>) -> Result<Self, ConfigError> {
        self.timeout = timeout.into().resolve()?;
        Ok(self)
    }

    pub fn with_total_timeout(
        mut self,
        total_timeout: impl Into<DurationSpec>,
    ) -> Result<Self, ConfigError> {
        self.total_timeout = Some(total_timeout.into().resolve()?);
        Ok(self)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Rejects values the orchestrator cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        if self.total_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Zero("total_timeout"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        // Expand environment variables like ${SCRIPT_TIMEOUT}
        let expanded = shellexpand::env(&content).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&expanded).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: display,
                reason,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.sandbox.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── parse_duration tests ────────────────────────────

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_bare_number_is_millis() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        let err = parse_duration("soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn test_duration_spec_conversions() {
        assert_eq!(
            DurationSpec::from(100).resolve().unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(
            DurationSpec::from("2s").resolve().unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            DurationSpec::from(Duration::from_millis(40)).resolve().unwrap(),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn test_duration_spec_saturates_huge_durations() {
        assert_eq!(
            DurationSpec::from(Duration::MAX).resolve().unwrap(),
            Duration::from_millis(u64::MAX)
        );
    }

    // ── SandboxOptions tests ────────────────────────────

    #[test]
    fn test_options_defaults() {
        let options = SandboxOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.total_timeout, None);
        assert_eq!(options.concurrency, 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_builders() {
        let options = SandboxOptions::default()
            .with_timeout("150ms")
            .unwrap()
            .with_total_timeout(1_000)
            .unwrap()
            .with_concurrency(4);
        assert_eq!(options.timeout, Duration::from_millis(150));
        assert_eq!(options.total_timeout, Some(Duration::from_secs(1)));
        assert_eq!(options.concurrency, 4);
    }

    #[test]
    fn test_options_malformed_timeout_fails_fast() {
        assert!(SandboxOptions::default().with_timeout("fast").is_err());
    }

    #[test]
    fn test_options_validate_rejects_zero_values() {
        let zero_concurrency = SandboxOptions::default().with_concurrency(0);
        assert!(matches!(
            zero_concurrency.validate(),
            Err(ConfigError::Zero("concurrency"))
        ));

        let zero_timeout = SandboxOptions::default().with_timeout(0).unwrap();
        assert!(matches!(
            zero_timeout.validate(),
            Err(ConfigError::Zero("timeout"))
        ));
    }

    // ── Config file tests ───────────────────────────────

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [sandbox]
            timeout = "150ms"
            total_timeout = 2000
            concurrency = 3

            [js]
            loop_iteration_limit = 1000

            [http]
            timeout = "10s"
            user_agent = "test-agent"

            [connector]
            payload_aliases = ["user", "account"]
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.timeout, Duration::from_millis(150));
        assert_eq!(config.sandbox.total_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.sandbox.concurrency, 3);
        assert_eq!(config.js.loop_iteration_limit, 1000);
        assert_eq!(config.js.recursion_limit, 512);
        assert_eq!(config.http.timeout, Duration::from_secs(10));
        assert_eq!(config.http.user_agent, "test-agent");
        assert_eq!(config.connector.payload_aliases, vec!["user", "account"]);
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.sandbox, SandboxOptions::default());
        assert!(config.connector.payload_aliases.contains(&"user".to_string()));
    }

    #[test]
    fn test_parse_config_bad_duration() {
        let err = Config::parse("[sandbox]\ntimeout = \"whenever\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_parse_config_zero_concurrency() {
        let err = Config::parse("[sandbox]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Zero("concurrency")));
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("SCRIPTBOX_TEST_TIMEOUT", "75ms");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\ntimeout = \"${{SCRIPTBOX_TEST_TIMEOUT}}\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sandbox.timeout, Duration::from_millis(75));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/scriptbox.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
