//! Engine configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `FIELDCARE_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `FIELDCARE_LOGGING__LEVEL=debug`.

use crate::error::SyncResult;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "FIELDCARE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server base URL, used until a login supplies one
    pub server_url: String,
    /// Per-request HTTP timeout (milliseconds, for serialization)
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Grace window without storage writes before a phase is considered
    /// drained (milliseconds, for serialization)
    #[serde(with = "duration_millis")]
    pub quiescence_window: Duration,
    /// Wait for a retry/cancel decision when initial metadata loading fails.
    /// When false, or when nothing subscribes to engine events, the failure
    /// is cancelled immediately. The wait itself has no deadline.
    pub interactive_failure_decisions: bool,
    /// Capacity of the notification channel
    pub event_capacity: usize,
    /// SQLite database file
    pub database_path: String,
    /// Subscriber installed by `SyncEngine::open`
    #[serde(default)]
    pub logging: LoggerConfig,
}

// Serialize Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            quiescence_window: Duration::from_millis(5000),
            interactive_failure_decisions: true,
            event_capacity: 64,
            database_path: "fieldcare.db".to_string(),
            logging: LoggerConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by the environment
    pub fn load() -> SyncResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    /// Defaults overridden by a TOML file, then by the environment
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        Ok(Self::figment(Some(path.as_ref())).extract()?)
    }

    fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(SyncConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
