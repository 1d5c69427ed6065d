//! Startup configuration for the admission layer.
//!
//! Built once (from defaults, code, or a JSON file) and shared read-only afterwards.
//! Nothing in here is ever mutated at runtime, so it needs no synchronization.

use crate::identity::EndpointClass;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

const DEFAULT_AUTH_RPM: u32 = 10;
const DEFAULT_AUTH_BURST: u32 = 10;
const DEFAULT_TRACKING_RPM: u32 = 600;
const DEFAULT_TRACKING_BURST: u32 = 120;
const DEFAULT_SESSION_RPM: u32 = 120;
const DEFAULT_SESSION_BURST: u32 = 30;
const DEFAULT_PUBLIC_RPM: u32 = 300;
const DEFAULT_PUBLIC_BURST: u32 = 60;
const DEFAULT_DOCS_RPM: u32 = 60;
const DEFAULT_DOCS_BURST: u32 = 20;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_LOCKOUT_SECS: u64 = 15 * 60;

const DEFAULT_ACCESS_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ISSUER: &str = "trackgate";

const DEFAULT_IDLE_TTL_SECS: u64 = 10 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Errors produced when validating or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Refill rate must be > 0.
    #[error("requests_per_minute for {class} must be > 0")]
    InvalidRate {
        /// Offending class.
        class: EndpointClass,
    },
    /// Burst must allow at least one request.
    #[error("burst_size for {class} must be >= 1")]
    InvalidBurst {
        /// Offending class.
        class: EndpointClass,
    },
    /// Lockout needs at least one failure to trigger.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// A duration that must be positive was zero.
    #[error("{field} must be > 0")]
    ZeroDuration {
        /// Name of the field.
        field: &'static str,
    },
    /// Refresh tokens must outlive the access tokens they renew.
    #[error("refresh_token_ttl ({refresh:?}) must exceed access_token_ttl ({access:?})")]
    RefreshShorterThanAccess {
        /// Configured access TTL.
        access: Duration,
        /// Configured refresh TTL.
        refresh: Duration,
    },
    /// The configuration document could not be parsed.
    #[error("failed to parse admission config: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration source could not be read.
    #[error("failed to read admission config: {0}")]
    Io(#[from] std::io::Error),
}

/// Token-bucket parameters for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    requests_per_minute: u32,
    burst_size: u32,
}

impl RateLimitConfig {
    /// Create a config. Validation happens when the owning [`AdmissionConfig`] is validated,
    /// because errors name the class.
    pub const fn new(requests_per_minute: u32, burst_size: u32) -> Self {
        Self { requests_per_minute, burst_size }
    }

    /// Sustained refill rate.
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Bucket capacity.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    fn validate(&self, class: EndpointClass) -> Result<(), ConfigError> {
        if self.requests_per_minute == 0 {
            return Err(ConfigError::InvalidRate { class });
        }
        if self.burst_size == 0 {
            return Err(ConfigError::InvalidBurst { class });
        }
        Ok(())
    }
}

/// Per-class limiter settings, indexed by [`EndpointClass::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitTable {
    entries: [RateLimitConfig; 5],
}

impl RateLimitTable {
    /// Look up the settings for a class. O(1), no hashing.
    pub fn get(&self, class: EndpointClass) -> &RateLimitConfig {
        &self.entries[class.index()]
    }

    /// Replace the settings for one class.
    pub fn set(&mut self, class: EndpointClass, config: RateLimitConfig) {
        self.entries[class.index()] = config;
    }

    /// Iterate `(class, config)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (EndpointClass, &RateLimitConfig)> {
        EndpointClass::ALL.into_iter().map(move |class| (class, self.get(class)))
    }
}

impl Default for RateLimitTable {
    fn default() -> Self {
        let mut entries = [RateLimitConfig::new(0, 0); 5];
        entries[EndpointClass::Auth.index()] =
            RateLimitConfig::new(DEFAULT_AUTH_RPM, DEFAULT_AUTH_BURST);
        entries[EndpointClass::Tracking.index()] =
            RateLimitConfig::new(DEFAULT_TRACKING_RPM, DEFAULT_TRACKING_BURST);
        entries[EndpointClass::Session.index()] =
            RateLimitConfig::new(DEFAULT_SESSION_RPM, DEFAULT_SESSION_BURST);
        entries[EndpointClass::Public.index()] =
            RateLimitConfig::new(DEFAULT_PUBLIC_RPM, DEFAULT_PUBLIC_BURST);
        entries[EndpointClass::Docs.index()] =
            RateLimitConfig::new(DEFAULT_DOCS_RPM, DEFAULT_DOCS_BURST);
        Self { entries }
    }
}

/// Lockout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BruteForceConfig {
    failure_threshold: u32,
    lockout_duration: Duration,
}

impl BruteForceConfig {
    /// Create a validated config.
    pub fn new(failure_threshold: u32, lockout_duration: Duration) -> Result<Self, ConfigError> {
        let cfg = Self { failure_threshold, lockout_duration };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Consecutive failures that trigger a lockout.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// How long a lockout lasts.
    pub fn lockout_duration(&self) -> Duration {
        self.lockout_duration
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.lockout_duration.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "lockout_duration" });
        }
        Ok(())
    }
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            lockout_duration: Duration::from_secs(DEFAULT_LOCKOUT_SECS),
        }
    }
}

/// Credential lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialConfig {
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    issuer: String,
}

impl CredentialConfig {
    /// Create a validated config.
    pub fn new(
        access_token_ttl: Duration,
        refresh_token_ttl: Duration,
        issuer: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let cfg = Self { access_token_ttl, refresh_token_ttl, issuer: issuer.into() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lifetime of access tokens.
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    /// Lifetime of refresh tokens.
    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    /// Value of the `iss` claim.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "access_token_ttl" });
        }
        if self.refresh_token_ttl <= self.access_token_ttl {
            return Err(ConfigError::RefreshShorterThanAccess {
                access: self.access_token_ttl,
                refresh: self.refresh_token_ttl,
            });
        }
        Ok(())
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TTL_SECS),
            issuer: DEFAULT_ISSUER.to_string(),
        }
    }
}

/// Complete configuration surface of the admission layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Per-class limiter settings.
    pub rate_limits: RateLimitTable,
    /// Lockout settings.
    pub brute_force: BruteForceConfig,
    /// Credential lifetimes.
    pub credentials: CredentialConfig,
    /// Entries untouched for this long become eligible for eviction.
    pub idle_ttl: Duration,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
    /// Admit requests when the admission layer itself fails. Off by default (fail closed).
    pub fail_open: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitTable::default(),
            brute_force: BruteForceConfig::default(),
            credentials: CredentialConfig::default(),
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            fail_open: false,
        }
    }
}

impl AdmissionConfig {
    /// Override the limiter settings for one class.
    pub fn with_rate_limit(mut self, class: EndpointClass, config: RateLimitConfig) -> Self {
        self.rate_limits.set(class, config);
        self
    }

    /// Override lockout settings.
    pub fn with_brute_force(mut self, config: BruteForceConfig) -> Self {
        self.brute_force = config;
        self
    }

    /// Override credential lifetimes.
    pub fn with_credentials(mut self, config: CredentialConfig) -> Self {
        self.credentials = config;
        self
    }

    /// Check every value; run once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (class, cfg) in self.rate_limits.iter() {
            cfg.validate(class)?;
        }
        self.brute_force.validate()?;
        self.credentials.validate()?;
        if self.idle_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "idle_ttl" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "sweep_interval" });
        }
        Ok(())
    }

    /// Parse a JSON document. Missing fields fall back to defaults; durations are seconds.
    ///
    /// ```
    /// use trackgate::config::AdmissionConfig;
    /// use trackgate::EndpointClass;
    ///
    /// let cfg = AdmissionConfig::from_json_str(
    ///     r#"{ "rate_limits": { "auth": { "requests_per_minute": 6, "burst_size": 3 } },
    ///          "brute_force": { "failure_threshold": 3 } }"#,
    /// ).unwrap();
    /// assert_eq!(cfg.rate_limits.get(EndpointClass::Auth).burst_size(), 3);
    /// assert_eq!(cfg.brute_force.failure_threshold(), 3);
    /// ```
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        file.into_config()
    }

    /// Like [`AdmissionConfig::from_json_str`], reading from any source.
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_reader(reader)?;
        file.into_config()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    rate_limits: RateLimitsFile,
    brute_force: BruteForceFile,
    credentials: CredentialsFile,
    idle_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    fail_open: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RateLimitsFile {
    auth: Option<RateLimitFile>,
    tracking: Option<RateLimitFile>,
    session: Option<RateLimitFile>,
    public: Option<RateLimitFile>,
    docs: Option<RateLimitFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitFile {
    requests_per_minute: u32,
    burst_size: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BruteForceFile {
    failure_threshold: Option<u32>,
    lockout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CredentialsFile {
    access_token_ttl_secs: Option<u64>,
    refresh_token_ttl_secs: Option<u64>,
    issuer: Option<String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<AdmissionConfig, ConfigError> {
        let mut cfg = AdmissionConfig::default();

        let overrides = [
            (EndpointClass::Auth, self.rate_limits.auth),
            (EndpointClass::Tracking, self.rate_limits.tracking),
            (EndpointClass::Session, self.rate_limits.session),
            (EndpointClass::Public, self.rate_limits.public),
            (EndpointClass::Docs, self.rate_limits.docs),
        ];
        for (class, entry) in overrides {
            if let Some(entry) = entry {
                cfg.rate_limits
                    .set(class, RateLimitConfig::new(entry.requests_per_minute, entry.burst_size));
            }
        }

        if let Some(threshold) = self.brute_force.failure_threshold {
            cfg.brute_force.failure_threshold = threshold;
        }
        if let Some(secs) = self.brute_force.lockout_secs {
            cfg.brute_force.lockout_duration = Duration::from_secs(secs);
        }

        if let Some(secs) = self.credentials.access_token_ttl_secs {
            cfg.credentials.access_token_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.credentials.refresh_token_ttl_secs {
            cfg.credentials.refresh_token_ttl = Duration::from_secs(secs);
        }
        if let Some(issuer) = self.credentials.issuer {
            cfg.credentials.issuer = issuer;
        }

        if let Some(secs) = self.idle_ttl_secs {
            cfg.idle_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(fail_open) = self.fail_open {
            cfg.fail_open = fail_open;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_auth_is_strictest() {
        let cfg = AdmissionConfig::default();
        cfg.validate().expect("defaults validate");
        let auth = cfg.rate_limits.get(EndpointClass::Auth);
        let tracking = cfg.rate_limits.get(EndpointClass::Tracking);
        assert!(auth.requests_per_minute() < tracking.requests_per_minute());
        assert!(auth.burst_size() < tracking.burst_size());
        assert_eq!(cfg.brute_force.failure_threshold(), 5);
        assert_eq!(cfg.brute_force.lockout_duration(), Duration::from_secs(900));
        // A lockout must be reachable within one burst of login attempts.
        assert!(auth.burst_size() > cfg.brute_force.failure_threshold());
        assert!(!cfg.fail_open);
    }

    #[test]
    fn rejects_zero_rate() {
        let cfg = AdmissionConfig::default()
            .with_rate_limit(EndpointClass::Docs, RateLimitConfig::new(0, 10));
        let err = cfg.validate().expect_err("zero rate is invalid");
        assert!(matches!(err, ConfigError::InvalidRate { class: EndpointClass::Docs }));
    }

    #[test]
    fn rejects_zero_burst() {
        let cfg = AdmissionConfig::default()
            .with_rate_limit(EndpointClass::Session, RateLimitConfig::new(60, 0));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidBurst { class: EndpointClass::Session })
        ));
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = BruteForceConfig::new(0, Duration::from_secs(1)).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidFailureThreshold { provided: 0 }));
    }

    #[test]
    fn rejects_refresh_not_longer_than_access() {
        let err = CredentialConfig::new(Duration::from_secs(60), Duration::from_secs(60), "x")
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::RefreshShorterThanAccess { .. }));
    }

    #[test]
    fn json_overrides_merge_with_defaults() {
        let cfg = AdmissionConfig::from_json_str(
            r#"{
                "rate_limits": { "tracking": { "requests_per_minute": 1200, "burst_size": 200 } },
                "brute_force": { "lockout_secs": 60 },
                "credentials": { "access_token_ttl_secs": 3600, "issuer": "tracks.example" },
                "fail_open": true
            }"#,
        )
        .expect("valid config");
        assert_eq!(cfg.rate_limits.get(EndpointClass::Tracking).requests_per_minute(), 1200);
        assert_eq!(cfg.rate_limits.get(EndpointClass::Auth).burst_size(), DEFAULT_AUTH_BURST);
        assert_eq!(cfg.brute_force.lockout_duration(), Duration::from_secs(60));
        assert_eq!(cfg.brute_force.failure_threshold(), DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(cfg.credentials.access_token_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.credentials.issuer(), "tracks.example");
        assert!(cfg.fail_open);
    }

    #[test]
    fn json_rejects_unknown_fields_and_invalid_values() {
        assert!(matches!(
            AdmissionConfig::from_json_str(r#"{ "rate_limit": {} }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AdmissionConfig::from_json_str(r#"{ "idle_ttl_secs": 0 }"#),
            Err(ConfigError::ZeroDuration { field: "idle_ttl" })
        ));
    }

    #[test]
    fn json_reader_accepts_empty_object() {
        let cfg = AdmissionConfig::from_json_reader("{}".as_bytes()).expect("defaults");
        assert_eq!(cfg, AdmissionConfig::default());
    }
}
