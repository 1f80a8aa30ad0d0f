//! Configuration types for the verification engine.
//!
//! Provides configuration with builder pattern for:
//! - Batch sizing and SMTP enablement
//! - Connect/read/DNS timeouts and retry bounds
//! - Connection pooling and idle eviction
//! - Sender identity pools for rotation
//! - STARTTLS policy and the plus-addressing provider table

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{VerifyError, VerifyResult};

/// Default SMTP port (server-to-server).
pub const DEFAULT_PORT: u16 = 25;

/// Default batch group size.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default timeout for TCP connects.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for each protocol read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted address length.
pub const MAX_EMAIL_LENGTH: usize = 250;

/// STARTTLS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTlsMode {
    /// Require STARTTLS; fail the probe if the server does not offer it.
    On,
    /// Never attempt STARTTLS.
    Off,
    /// Use STARTTLS when advertised, otherwise continue in clear text.
    #[default]
    Auto,
}

/// How a provider treats `user+tag` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlusAddressingPolicy {
    /// Tags are delivered to the base mailbox.
    Allow,
    /// Tags are not honoured; tagged addresses are rejected.
    Deny,
}

/// Validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Group size for batch validation.
    pub batch_size: usize,
    /// Run live SMTP probes.
    pub enable_smtp_validation: bool,
    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// DNS query timeout.
    #[serde(with = "humantime_serde")]
    pub dns_timeout: Duration,
    /// Extra MX hosts tried after the first one fails to connect.
    pub max_retries: u32,
    /// Retained connections per exchanger.
    pub max_connections_per_pool: usize,
    /// Idle time after which a retained connection is closed.
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// Interval of the idle sweep.
    #[serde(with = "humantime_serde")]
    pub pool_sweep_interval: Duration,
    /// Wait for a retained connection before opening an overflow one.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Reuse connections across probes.
    pub enable_connection_pooling: bool,
    /// SMTP port of mail exchangers.
    pub smtp_port: u16,
    /// Lifetime of successful MX cache entries.
    #[serde(with = "humantime_serde")]
    pub mx_cache_ttl: Duration,
    /// Lifetime of failed MX cache entries.
    #[serde(with = "humantime_serde")]
    pub mx_failure_ttl: Duration,
    /// HELO domain pool.
    pub helo_domains: Vec<String>,
    /// MAIL FROM address pool.
    pub from_addresses: Vec<String>,
    /// STARTTLS policy.
    pub starttls: StartTlsMode,
    /// Skip certificate checks when STARTTLS is required. `Auto` never
    /// checks certificates.
    pub accept_invalid_certs: bool,
    /// Interval of the expired MX cache entry sweep.
    #[serde(with = "humantime_serde")]
    pub mx_cache_sweep_interval: Duration,
    /// Record SMTP transcripts.
    pub verbose: bool,
    /// Minimum score for `valid = true`.
    pub min_valid_score: u8,
    /// Treat typo domains as hard failures.
    pub reject_typo_domains: bool,
    /// Probe a random recipient to detect catch-all domains.
    pub detect_catch_all: bool,
    /// Cap on per-domain rotation usage entries.
    pub max_tracked_domains: usize,
    /// Per-provider plus-addressing table, keyed by lowercase domain.
    pub plus_addressing: HashMap<String, PlusAddressingPolicy>,
}

fn default_plus_addressing() -> HashMap<String, PlusAddressingPolicy> {
    use PlusAddressingPolicy::{Allow, Deny};
    [
        ("gmail.com", Allow),
        ("googlemail.com", Allow),
        ("outlook.com", Allow),
        ("hotmail.com", Allow),
        ("live.com", Allow),
        ("icloud.com", Allow),
        ("me.com", Allow),
        ("fastmail.com", Allow),
        ("aol.com", Deny),
        ("yandex.com", Deny),
        ("yandex.ru", Deny),
        ("protonmail.com", Deny),
        ("proton.me", Deny),
    ]
    .into_iter()
    .map(|(domain, policy)| (domain.to_string(), policy))
    .collect()
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            enable_smtp_validation: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            dns_timeout: Duration::from_secs(5),
            max_retries: 2,
            max_connections_per_pool: 3,
            max_idle_time: Duration::from_secs(30),
            pool_sweep_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(2),
            enable_connection_pooling: true,
            smtp_port: DEFAULT_PORT,
            mx_cache_ttl: Duration::from_secs(300),
            mx_failure_ttl: Duration::from_secs(30),
            helo_domains: vec!["localhost".to_string()],
            from_addresses: vec!["verify@localhost".to_string()],
            starttls: StartTlsMode::Auto,
            accept_invalid_certs: false,
            mx_cache_sweep_interval: Duration::from_secs(60),
            verbose: false,
            min_valid_score: 50,
            reject_typo_domains: true,
            detect_catch_all: false,
            max_tracked_domains: 10_000,
            plus_addressing: default_plus_addressing(),
        }
    }
}

impl ValidatorConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ValidatorConfigBuilder {
        ValidatorConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> VerifyResult<Self> {
        let mut config: Self = serde_json::from_str(json).map_err(|e| {
            VerifyError::configuration(format!("Invalid configuration JSON: {}", e)).with_cause(e)
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> VerifyResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VerifyError::configuration(format!("Cannot read {}: {}", path.display(), e)).with_cause(e)
        })?;
        Self::from_json_str(&contents)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> VerifyResult<()> {
        if self.batch_size == 0 {
            return Err(VerifyError::configuration("batch_size must be positive"));
        }

        if self.max_connections_per_pool == 0 {
            return Err(VerifyError::configuration(
                "max_connections_per_pool must be positive",
            ));
        }

        if self.smtp_port == 0 {
            return Err(VerifyError::configuration("smtp_port must be non-zero"));
        }

        if self.helo_domains.is_empty() {
            return Err(VerifyError::configuration("helo_domains must not be empty"));
        }

        if self.helo_domains.iter().any(|d| d.trim().is_empty()) {
            return Err(VerifyError::configuration("helo_domains must not contain blank entries"));
        }

        if self.from_addresses.is_empty() {
            return Err(VerifyError::configuration("from_addresses must not be empty"));
        }

        if self.from_addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(VerifyError::configuration(
                "from_addresses must not contain blank entries",
            ));
        }

        if let Some(bad) = self.from_addresses.iter().find(|a| !a.contains('@')) {
            return Err(VerifyError::configuration(format!(
                "from address {:?} is not an email address",
                bad
            )));
        }

        if self.min_valid_score > 100 {
            return Err(VerifyError::configuration("min_valid_score must be within 0..=100"));
        }

        if self.mx_cache_sweep_interval.is_zero() || self.pool_sweep_interval.is_zero() {
            return Err(VerifyError::configuration("sweep intervals must be non-zero"));
        }

        Ok(())
    }

    /// Lowercases the keys of the plus-addressing table.
    pub fn normalize(&mut self) {
        let table = std::mem::take(&mut self.plus_addressing);
        self.plus_addressing = table
            .into_iter()
            .map(|(domain, policy)| (domain.trim().to_ascii_lowercase(), policy))
            .collect();
    }

    /// Looks up the plus-addressing policy for a domain.
    pub fn plus_addressing_policy(&self, domain: &str) -> PlusAddressingPolicy {
        self.plus_addressing
            .get(&domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(PlusAddressingPolicy::Allow)
    }
}

/// Builder for validator configuration.
#[derive(Debug, Default)]
pub struct ValidatorConfigBuilder {
    config: ValidatorConfig,
}

impl ValidatorConfigBuilder {
    /// Sets the batch group size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Enables or disables SMTP probing.
    pub fn enable_smtp_validation(mut self, enabled: bool) -> Self {
        self.config.enable_smtp_validation = enabled;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sets DNS timeout.
    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.config.dns_timeout = timeout;
        self
    }

    /// Sets the number of additional MX hosts tried.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Sets the per-host retained connection cap.
    pub fn max_connections_per_pool(mut self, max: usize) -> Self {
        self.config.max_connections_per_pool = max;
        self
    }

    /// Sets the idle eviction threshold.
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.config.max_idle_time = idle;
        self
    }

    /// Sets the idle sweep interval.
    pub fn pool_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.pool_sweep_interval = interval;
        self
    }

    /// Sets the pool acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Enables or disables connection pooling.
    pub fn enable_connection_pooling(mut self, enabled: bool) -> Self {
        self.config.enable_connection_pooling = enabled;
        self
    }

    /// Sets the exchanger SMTP port.
    pub fn smtp_port(mut self, port: u16) -> Self {
        self.config.smtp_port = port;
        self
    }

    /// Sets MX cache lifetimes for successful and failed lookups.
    pub fn mx_cache_ttls(mut self, success: Duration, failure: Duration) -> Self {
        self.config.mx_cache_ttl = success;
        self.config.mx_failure_ttl = failure;
        self
    }

    /// Sets the HELO domain pool.
    pub fn helo_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.helo_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the MAIL FROM address pool.
    pub fn from_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.from_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the STARTTLS policy.
    pub fn starttls(mut self, mode: StartTlsMode) -> Self {
        self.config.starttls = mode;
        self
    }

    /// Skips certificate checks for required STARTTLS.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// Sets the expired MX cache entry sweep interval.
    pub fn mx_cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.mx_cache_sweep_interval = interval;
        self
    }

    /// Enables transcript recording.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Sets the minimum score for a valid verdict.
    pub fn min_valid_score(mut self, score: u8) -> Self {
        self.config.min_valid_score = score;
        self
    }

    /// Sets whether typo domains are hard failures.
    pub fn reject_typo_domains(mut self, reject: bool) -> Self {
        self.config.reject_typo_domains = reject;
        self
    }

    /// Enables catch-all detection.
    pub fn detect_catch_all(mut self, detect: bool) -> Self {
        self.config.detect_catch_all = detect;
        self
    }

    /// Sets the cap on tracked rotation domains.
    pub fn max_tracked_domains(mut self, max: usize) -> Self {
        self.config.max_tracked_domains = max;
        self
    }

    /// Overrides the policy of one provider in the plus-addressing table.
    pub fn plus_addressing(mut self, domain: impl Into<String>, policy: PlusAddressingPolicy) -> Self {
        self.config
            .plus_addressing
            .insert(domain.into().to_ascii_lowercase(), policy);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> VerifyResult<ValidatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-call overrides for `SmtpVerificationService::verify_email`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyOptions {
    /// Fixed HELO domain instead of a rotated one.
    pub helo_domain: Option<String>,
    /// Fixed MAIL FROM address instead of a rotated one.
    pub from_address: Option<String>,
    /// Override of `max_retries`.
    pub max_retries: Option<u32>,
    /// Override of `verbose`.
    pub verbose: Option<bool>,
    /// Override of the STARTTLS policy.
    pub starttls: Option<StartTlsMode>,
    /// Override of `detect_catch_all`.
    pub detect_catch_all: Option<bool>,
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
