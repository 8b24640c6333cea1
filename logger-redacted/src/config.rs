// Logger configuration
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Install a global subscriber when the engine opens
    pub enabled: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// One JSON object per event instead of the human-readable format
    pub json: bool,
    /// Mask credentials and account identifiers in every written line
    pub redaction_enabled: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
            json: false,
            redaction_enabled: true,
        }
    }
}
