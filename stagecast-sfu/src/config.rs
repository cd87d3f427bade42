//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which viewers keep a departed publisher's track listed after the grace period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerScope {
    /// Any receive transport anywhere in the relay
    #[default]
    Global,
    /// Only consumers of the same room
    Room,
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Delay between a publisher's connection loss and removal of its tracks
    pub producer_grace_period_secs: u64,
    /// Viewer presence check used when the grace period expires
    pub viewer_scope: ViewerScope,
    /// Close the previous track's send transport when a publish replaces it
    pub close_replaced_producers: bool,
    /// Maximum receive transports per connection (0 = unlimited)
    pub max_receive_transports: usize,
    /// Address advertised in ICE candidates
    pub announced_ip: String,
    /// First port handed out for ICE candidates
    pub rtc_min_port: u16,
    /// Last port handed out for ICE candidates
    pub rtc_max_port: u16,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            producer_grace_period_secs: 30,
            viewer_scope: ViewerScope::Global,
            close_replaced_producers: false,
            max_receive_transports: 0,
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.producer_grace_period_secs)
    }

    /// Collect configuration problems
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) must be non-zero and not above sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.announced_ip.is_empty() {
            errors.push("sfu.announced_ip must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SfuConfig::default();
        assert_eq!(config.grace_period(), Duration::from_secs(30));
        assert_eq!(config.viewer_scope, ViewerScope::Global);
        assert!(!config.close_replaced_producers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let config = SfuConfig {
            rtc_min_port: 50000,
            rtc_max_port: 40000,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().len(), 1);
    }
}
