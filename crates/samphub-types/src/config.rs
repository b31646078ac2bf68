//! Hub configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level hub configuration (`~/.samphub/config.toml`).
///
/// Every field has a default, so a partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Value of the hub's own `samp.name` metadata.
    pub hub_name: String,
    /// Address the TCP binding listens on.
    pub listen_addr: String,
    /// Period of the housekeeping sweep (call deadlines, dead clients).
    pub housekeeping_interval_ms: u64,
    /// Deadline applied to asynchronous calls. 0 disables it.
    pub default_call_timeout_secs: u64,
    /// How many finished calls are remembered to recognise late replies.
    pub retired_history: usize,
    /// Largest accepted wire frame, in bytes.
    pub max_message_size: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_name: "SAMP Hub".to_string(),
            listen_addr: "127.0.0.1:21012".to_string(),
            housekeeping_interval_ms: 500,
            default_call_timeout_secs: 0,
            retired_history: 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl HubConfig {
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    /// Deadline for asynchronous calls, if any.
    pub fn default_call_timeout(&self) -> Option<Duration> {
        (self.default_call_timeout_secs > 0)
            .then(|| Duration::from_secs(self.default_call_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:21012");
        assert!(config.default_call_timeout().is_none());
        assert_eq!(config.housekeeping_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: HubConfig =
            serde_json::from_str(r#"{"default_call_timeout_secs": 30}"#).unwrap();
        assert_eq!(config.default_call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.hub_name, "SAMP Hub");
    }
}
