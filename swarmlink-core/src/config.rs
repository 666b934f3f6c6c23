//! Centralized configuration for the swarm engine.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::scheduler::SchedulerWeights;

/// Central configuration for all swarm engine components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    pub scheduler: SchedulerConfig,
    pub adaptive: AdaptiveConfig,
    pub transfer: TransferConfig,
    pub upload: UploadConfig,
}

/// Chunk assignment configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum outstanding chunks per peer before it is skipped
    pub max_in_flight_per_peer: usize,
    /// Peers whose reputation falls below this are never assigned work
    pub reputation_floor: f64,
    /// Cost-model weights used until adaptation changes them
    pub initial_weights: SchedulerWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_peer: 8,
            reputation_floor: 0.1,
            initial_weights: SchedulerWeights::default(),
        }
    }
}

/// Weight-learning configuration.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Completions remembered per peer
    pub window_size: usize,
    /// Completions (across all peers) between adaptation passes
    pub adaptation_interval: u64,
    /// Minimum remembered completions before weights may change
    pub min_samples: usize,
    /// Amount moved between the most and least predictive signals per pass
    pub learning_rate: f64,
    /// No weight is pushed below this by adaptation
    pub min_weight: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            adaptation_interval: 50,
            min_samples: 10,
            learning_rate: 0.05,
            min_weight: 0.05,
        }
    }
}

/// Downloader-side transfer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Nominal chunk size in bytes
    pub chunk_size: u64,
    /// Time allowed to receive an acceptable offer
    pub negotiation_timeout: Duration,
    /// Time allowed between chunk responses while requests are outstanding
    pub idle_timeout: Duration,
    /// Chunk requests kept outstanding per peer
    pub pipeline_depth: usize,
    /// Bound on local teardown when the peer does not cooperate
    pub cancel_timeout: Duration,
    /// Offers below this quality are refused
    pub min_offer_quality: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_048_576, // 1 MiB
            negotiation_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            pipeline_depth: 4,
            cancel_timeout: Duration::from_secs(5),
            min_offer_quality: 0,
        }
    }
}

/// Uploader-side serving configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Time an offer stays valid without a chunk request
    pub offer_ttl: Duration,
    /// How long finished uploads are remembered for late requests
    pub retention: Duration,
    /// Concurrent serving sessions allowed
    pub max_serving_slots: usize,
    /// Global outbound rate in bytes per second
    pub global_rate_bps: u64,
    /// Per-session outbound rate in bytes per second
    pub per_connection_rate_bps: u64,
    /// Burst capacity as multiple of sustained rate
    pub burst_multiplier: f64,
    /// Largest byte range one chunk request may ask for. Longer requests are
    /// a policy violation and reject the upload. The effective limit is also
    /// capped by the smallest token bucket, so every admitted request can be paid.
    pub max_request_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(600),
            retention: Duration::from_secs(300),
            max_serving_slots: 8,
            global_rate_bps: 10_485_760,        // 10 MiB/s
            per_connection_rate_bps: 2_097_152, // 2 MiB/s
            burst_multiplier: 2.0,
            max_request_bytes: 4_194_304, // 4 MiB
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("Invalid configuration: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

impl SwarmConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(cap) = env_parse::<usize>("SWARMLINK_MAX_IN_FLIGHT_PER_PEER") {
            config.scheduler.max_in_flight_per_peer = cap;
        }

        if let Some(floor) = env_parse::<f64>("SWARMLINK_REPUTATION_FLOOR") {
            config.scheduler.reputation_floor = floor;
        }

        if let Some(seconds) = env_parse::<u64>("SWARMLINK_NEGOTIATION_TIMEOUT") {
            config.transfer.negotiation_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SWARMLINK_IDLE_TIMEOUT") {
            config.transfer.idle_timeout = Duration::from_secs(seconds);
        }

        if let Some(depth) = env_parse::<usize>("SWARMLINK_PIPELINE_DEPTH") {
            config.transfer.pipeline_depth = depth;
        }

        if let Some(slots) = env_parse::<usize>("SWARMLINK_UPLOAD_SLOTS") {
            config.upload.max_serving_slots = slots;
        }

        if let Some(rate) = env_parse::<u64>("SWARMLINK_UPLOAD_RATE") {
            config.upload.global_rate_bps = rate;
        }

        if let Some(bytes) = env_parse::<u64>("SWARMLINK_MAX_REQUEST_BYTES") {
            config.upload.max_request_bytes = bytes;
        }

        config
    }

    /// Checks that the configuration is internally consistent.
    ///
    /// # Errors
    /// - `ConfigError` - First inconsistent value found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::new("chunk size must be greater than zero"));
        }
        if self.transfer.pipeline_depth == 0 {
            return Err(ConfigError::new("pipeline depth must be greater than zero"));
        }
        if self.scheduler.max_in_flight_per_peer == 0 {
            return Err(ConfigError::new("per-peer in-flight cap must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.scheduler.reputation_floor) {
            return Err(ConfigError::new(format!(
                "reputation floor must be within [0, 1], got {}",
                self.scheduler.reputation_floor
            )));
        }
        if !self.scheduler.initial_weights.is_normalized() {
            return Err(ConfigError::new(format!(
                "initial weights must be within [0, 1] and sum to 1, got sum {}",
                self.scheduler.initial_weights.sum()
            )));
        }
        if self.adaptive.window_size == 0 || self.adaptive.adaptation_interval == 0 {
            return Err(ConfigError::new(
                "adaptation window and interval must be greater than zero",
            ));
        }
        if self.upload.max_serving_slots == 0
            || self.upload.global_rate_bps == 0
            || self.upload.per_connection_rate_bps == 0
        {
            return Err(ConfigError::new("upload slots and rates must be greater than zero"));
        }
        if self.upload.max_request_bytes == 0 {
            return Err(ConfigError::new("max request size must be greater than zero"));
        }
        if self.upload.burst_multiplier < 1.0 {
            return Err(ConfigError::new(format!(
                "burst multiplier must be >= 1.0, got {}",
                self.upload.burst_multiplier
            )));
        }
        Ok(())
    }
}

impl ConfigError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adaptive.window_size, 100);
        assert_eq!(config.adaptive.adaptation_interval, 50);
        assert_eq!(config.adaptive.min_samples, 10);
        assert_eq!(config.transfer.pipeline_depth, 4);
        assert_eq!(config.transfer.negotiation_timeout, Duration::from_secs(30));
        assert_eq!(config.upload.offer_ttl, Duration::from_secs(600));
        assert_eq!(config.upload.retention, Duration::from_secs(300));
        assert_eq!(config.upload.max_request_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_request_limit() {
        let mut config = SwarmConfig::default();
        config.upload.max_request_bytes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.reason.contains("max request size"));
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = SwarmConfig::default();
        config.scheduler.initial_weights.rtt_weight = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.reason.contains("sum to 1"));
    }

    #[test]
    fn test_validate_rejects_zero_pipeline() {
        let mut config = SwarmConfig::default();
        config.transfer.pipeline_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_floor_out_of_range() {
        let mut config = SwarmConfig::default();
        config.scheduler.reputation_floor = 1.5;
        assert!(config.validate().is_err());
    }
}
