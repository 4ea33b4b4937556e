//! Manager configuration.
//!
//! [`MeshConfig`] carries every tunable with its default. Values can come from
//! a JSON document, from environment overrides, or both (file first, then the
//! environment on top).
//!
//! | Field | Default | Environment |
//! |-------|---------|-------------|
//! | `manager_name` | `nsmgr` | `NSM_NAME` |
//! | `heal_enabled` | `true` | `NSMD_HEAL_ENABLED` |
//! | `heal_retry_count` | 10 | `NSMD_HEAL_RETRY_COUNT` |
//! | `heal_retry_delay` | 5 s | |
//! | `heal_dst_wait_timeout` | 30 s | `NSMD_HEAL_DST_TIMEOUT` (seconds) |
//! | `forwarder_retry_count` | 10 | `NSMD_FORWARDER_RETRY_COUNT` |
//! | `forwarder_retry_delay` | 500 ms | `NSMD_FORWARDER_RETRY_DELAY_MS` |
//! | `forwarder_timeout` | 15 s | `NSMD_FORWARDER_TIMEOUT` (seconds) |
//! | `forwarder_wait_timeout` | 15 s | `NSMD_FORWARDER_WAIT_TIMEOUT` (seconds) |
//! | `error_close_timeout` | 15 s | |
//! | `close_timeout` | 5 s | |
//! | `preferred_mechanism` | none | `NSMD_PREFERRED_MECHANISM` |
//!
//! An override that does not parse is logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ManagerName, MeshError};

pub const NSM_NAME_ENV: &str = "NSM_NAME";
pub const HEAL_ENABLED_ENV: &str = "NSMD_HEAL_ENABLED";
pub const HEAL_RETRY_COUNT_ENV: &str = "NSMD_HEAL_RETRY_COUNT";
pub const HEAL_DST_TIMEOUT_ENV: &str = "NSMD_HEAL_DST_TIMEOUT";
pub const FORWARDER_RETRY_COUNT_ENV: &str = "NSMD_FORWARDER_RETRY_COUNT";
pub const FORWARDER_RETRY_DELAY_ENV: &str = "NSMD_FORWARDER_RETRY_DELAY_MS";
pub const FORWARDER_TIMEOUT_ENV: &str = "NSMD_FORWARDER_TIMEOUT";
pub const FORWARDER_WAIT_TIMEOUT_ENV: &str = "NSMD_FORWARDER_WAIT_TIMEOUT";
pub const PREFERRED_MECHANISM_ENV: &str = "NSMD_PREFERRED_MECHANISM";

/// Durations are written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Tunables of one network service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Name of this manager; recorded in connection paths.
    pub manager_name: String,
    /// Re-request established connections on failure instead of closing them.
    pub heal_enabled: bool,
    pub heal_retry_count: u32,
    #[serde(with = "millis")]
    pub heal_retry_delay: Duration,
    /// Deadline of each heal attempt.
    #[serde(with = "millis")]
    pub heal_dst_wait_timeout: Duration,
    /// Program attempts per request.
    pub forwarder_retry_count: u32,
    #[serde(with = "millis")]
    pub forwarder_retry_delay: Duration,
    /// Upper bound of each program attempt.
    #[serde(with = "millis")]
    pub forwarder_timeout: Duration,
    /// How long a request waits for the first forwarder to register.
    #[serde(with = "millis")]
    pub forwarder_wait_timeout: Duration,
    /// Deadline of the cleanup that follows a failed request.
    #[serde(with = "millis")]
    pub error_close_timeout: Duration,
    /// Deadline of downstream closes.
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    /// Mechanism type chosen whenever both sides offer it.
    pub preferred_mechanism: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            manager_name: "nsmgr".to_string(),
            heal_enabled: true,
            heal_retry_count: 10,
            heal_retry_delay: Duration::from_secs(5),
            heal_dst_wait_timeout: Duration::from_secs(30),
            forwarder_retry_count: 10,
            forwarder_retry_delay: Duration::from_millis(500),
            forwarder_timeout: Duration::from_secs(15),
            forwarder_wait_timeout: Duration::from_secs(15),
            error_close_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(5),
            preferred_mechanism: None,
        }
    }
}

fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring unparseable override");
            None
        }
    }
}

impl MeshConfig {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(NSM_NAME_ENV).filter(|n| !n.is_empty()) {
            self.manager_name = name;
        }
        if let Some(enabled) = parsed::<bool>(HEAL_ENABLED_ENV, lookup(HEAL_ENABLED_ENV)) {
            self.heal_enabled = enabled;
        }
        if let Some(count) = parsed(HEAL_RETRY_COUNT_ENV, lookup(HEAL_RETRY_COUNT_ENV)) {
            self.heal_retry_count = count;
        }
        if let Some(secs) = parsed(HEAL_DST_TIMEOUT_ENV, lookup(HEAL_DST_TIMEOUT_ENV)) {
            self.heal_dst_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = parsed(FORWARDER_RETRY_COUNT_ENV, lookup(FORWARDER_RETRY_COUNT_ENV)) {
            self.forwarder_retry_count = count;
        }
        if let Some(ms) = parsed(FORWARDER_RETRY_DELAY_ENV, lookup(FORWARDER_RETRY_DELAY_ENV)) {
            self.forwarder_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed(FORWARDER_TIMEOUT_ENV, lookup(FORWARDER_TIMEOUT_ENV)) {
            self.forwarder_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(FORWARDER_WAIT_TIMEOUT_ENV, lookup(FORWARDER_WAIT_TIMEOUT_ENV))
        {
            self.forwarder_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(mechanism) = lookup(PREFERRED_MECHANISM_ENV).filter(|m| !m.is_empty()) {
            self.preferred_mechanism = Some(mechanism);
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(document: &str) -> Result<Self, MeshError> {
        serde_json::from_str(document)
            .map_err(|e| MeshError::configuration(format!("invalid configuration: {e}")))
    }

    /// The manager name as an identifier.
    pub fn manager(&self) -> Result<ManagerName, MeshError> {
        ManagerName::new(self.manager_name.as_str())
            .ok_or_else(|| MeshError::configuration("manager_name cannot be empty"))
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), MeshError> {
        self.manager()?;
        if self.forwarder_retry_count == 0 {
            return Err(MeshError::configuration(
                "forwarder_retry_count must be at least 1",
            ));
        }
        if self.heal_retry_count == 0 {
            return Err(MeshError::configuration("heal_retry_count must be at least 1"));
        }
        if self.forwarder_timeout.is_zero() {
            return Err(MeshError::configuration("forwarder_timeout cannot be zero"));
        }
        Ok(())
    }
}
