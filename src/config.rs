//! Acquisition driver configuration.
//!
//! There is no persistent configuration in the core; this struct exists so
//! host applications can embed the driver knobs in their own config files
//! (all fields deserialize with defaults, durations accept humantime
//! strings such as `"30s"`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of an [`AcquisitionDriver`](crate::acquisition::AcquisitionDriver).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Whether a producer keeps running after a grab timeout. Timeouts are
    /// counted as transient errors either way; with `false` they stop the
    /// producer and surface at the next driver entry point.
    #[serde(default = "default_retry_on_timeout")]
    pub retry_on_timeout: bool,

    /// Ring capacity (in blocks) used when the driver allocates a buffer
    /// on behalf of the client.
    #[serde(default = "default_ring_capacity")]
    pub default_ring_capacity: u64,

    /// Upper bound for [`wait_for_completion`]
    /// (crate::acquisition::AcquisitionDriver::wait_for_completion).
    #[serde(with = "humantime_serde", default = "default_completion_timeout")]
    pub completion_timeout: Duration,
}

fn default_retry_on_timeout() -> bool {
    true
}

fn default_ring_capacity() -> u64 {
    16
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retry_on_timeout: default_retry_on_timeout(),
            default_ring_capacity: default_ring_capacity(),
            completion_timeout: default_completion_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AcquisitionConfig::default();
        assert!(config.retry_on_timeout);
        assert_eq!(config.default_ring_capacity, 16);
        assert_eq!(config.completion_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_with_humantime_and_defaults() {
        let config: AcquisitionConfig =
            serde_json::from_str(r#"{ "completion_timeout": "2s" }"#).unwrap();
        assert_eq!(config.completion_timeout, Duration::from_secs(2));
        assert!(config.retry_on_timeout);
        assert_eq!(config.default_ring_capacity, 16);
    }
}
