//! # Relay Configuration
//!
//! Tunables for node polling, reconnect backoff, health checks, abandonment
//! and load scoring. Every field has a serde default so partial documents
//! deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RemoteError, Result};

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub abandonment: AbandonmentConfig,
    #[serde(default)]
    pub penalty: PenaltyConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
}

impl RemoteConfig {
    /// Validate every section, reporting the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.tick
            .validate()
            .and_then(|_| self.backoff.validate())
            .and_then(|_| self.health.validate())
            .and_then(|_| self.abandonment.validate())
            .and_then(|_| self.penalty.validate())
            .and_then(|_| self.buffer.validate())
            .map_err(RemoteError::InvalidConfig)
    }
}

// ============================================================================
// Tick
// ============================================================================

/// Poll loop timing for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickConfig {
    /// Target time between the starts of consecutive ticks.
    ///
    /// Default: 500ms
    #[serde(default = "default_tick_interval")]
    pub interval: Duration,

    /// Minimum sleep between ticks, even when a tick overran the interval.
    ///
    /// Default: 10ms
    #[serde(default = "default_min_sleep")]
    pub min_sleep: Duration,

    /// Whole-exchange timeout for one tick request.
    ///
    /// Default: 1.5s
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Connect timeout for the node's HTTP endpoint.
    ///
    /// Default: 1s
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Path of the polling endpoint on every node.
    #[serde(default = "default_tick_path")]
    pub path: String,

    /// Number of tick records kept per node.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: default_tick_interval(),
            min_sleep: default_min_sleep(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            path: default_tick_path(),
            history_size: default_history_size(),
        }
    }
}

impl TickConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interval.is_zero() {
            return Err("tick.interval must be > 0".to_string());
        }
        if self.min_sleep > self.interval {
            return Err("tick.min_sleep cannot exceed tick.interval".to_string());
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("tick timeouts must be > 0".to_string());
        }
        if !self.path.starts_with('/') {
            return Err("tick.path must start with '/'".to_string());
        }
        if self.history_size == 0 {
            return Err("tick.history_size must be > 0".to_string());
        }
        Ok(())
    }

    /// How long to sleep after a tick that took `elapsed`.
    pub fn sleep_after(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed).max(self.min_sleep)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Reconnect delays keyed on consecutive failed connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_short_delay")]
    pub short_delay: Duration,
    #[serde(default = "default_medium_delay")]
    pub medium_delay: Duration,
    #[serde(default = "default_long_delay")]
    pub long_delay: Duration,
    /// Attempts after which `medium_delay` applies.
    #[serde(default = "default_medium_after")]
    pub medium_after: u32,
    /// Attempts after which `long_delay` applies.
    #[serde(default = "default_long_after")]
    pub long_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            short_delay: default_short_delay(),
            medium_delay: default_medium_delay(),
            long_delay: default_long_delay(),
            medium_after: default_medium_after(),
            long_after: default_long_after(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.medium_after > self.long_after {
            return Err("backoff.medium_after cannot exceed backoff.long_after".to_string());
        }
        if self.short_delay > self.medium_delay || self.medium_delay > self.long_delay {
            return Err("backoff delays must be non-decreasing".to_string());
        }
        Ok(())
    }

    /// Delay before the next connection attempt.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts < self.medium_after {
            self.short_delay
        } else if failed_attempts < self.long_after {
            self.medium_delay
        } else {
            self.long_delay
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// A node with sessions and no successful tick for this long loses them.
    ///
    /// Default: 10s
    #[serde(default = "default_kill_threshold")]
    pub kill_threshold: Duration,

    /// Period of the coordinator's health and adoption sweep.
    ///
    /// Default: 2s
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            kill_threshold: default_kill_threshold(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.kill_threshold.is_zero() {
            return Err("health.kill_threshold must be > 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("health.sweep_interval must be > 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Abandonment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonmentConfig {
    /// Maximum number of sessions waiting for a new node.
    #[serde(default = "default_abandoned_capacity")]
    pub capacity: usize,

    /// Age after which an abandoned session fails.
    ///
    /// Default: 10s
    #[serde(default = "default_expiry")]
    pub expiry: Duration,

    /// Nodes at or above this penalty never adopt.
    #[serde(default = "default_critical_penalty")]
    pub critical_penalty: u32,

    /// Smallest per-sweep adoption quota of a node.
    #[serde(default = "default_min_quota")]
    pub min_quota: u32,

    /// Quota is `playing_tracks / quota_divisor` when that exceeds `min_quota`.
    #[serde(default = "default_quota_divisor")]
    pub quota_divisor: u32,
}

impl Default for AbandonmentConfig {
    fn default() -> Self {
        Self {
            capacity: default_abandoned_capacity(),
            expiry: default_expiry(),
            critical_penalty: default_critical_penalty(),
            min_quota: default_min_quota(),
            quota_divisor: default_quota_divisor(),
        }
    }
}

impl AbandonmentConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capacity == 0 {
            return Err("abandonment.capacity must be > 0".to_string());
        }
        if self.expiry.is_zero() {
            return Err("abandonment.expiry must be > 0".to_string());
        }
        if self.quota_divisor == 0 {
            return Err("abandonment.quota_divisor must be > 0".to_string());
        }
        if self.min_quota == 0 {
            return Err("abandonment.min_quota must be > 0".to_string());
        }
        Ok(())
    }

    /// Number of sessions a node may adopt in one sweep.
    pub fn quota_for(&self, playing_tracks: u32) -> u32 {
        (playing_tracks / self.quota_divisor).max(self.min_quota)
    }
}

// ============================================================================
// Penalty
// ============================================================================

/// Constants of the load-scoring curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Playing sessions counted linearly up to this number.
    #[serde(default = "default_playing_linear_limit")]
    pub playing_linear_limit: u32,

    /// Exponent applied to playing sessions beyond the linear limit.
    #[serde(default = "default_playing_exponent")]
    pub playing_exponent: f64,

    #[serde(default = "default_playing_weight")]
    pub playing_weight: f64,

    /// `k` in `k / (1 - u) - k` for CPU utilization `u`.
    #[serde(default = "default_cpu_constant")]
    pub cpu_constant: f64,

    /// `k` of the timing curve, over `latency / latency_upper_bound`.
    #[serde(default = "default_timing_constant")]
    pub timing_constant: f64,

    /// Latency at which the timing penalty diverges.
    ///
    /// Default: 1.5s
    #[serde(default = "default_latency_upper_bound")]
    pub latency_upper_bound: Duration,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            playing_linear_limit: default_playing_linear_limit(),
            playing_exponent: default_playing_exponent(),
            playing_weight: default_playing_weight(),
            cpu_constant: default_cpu_constant(),
            timing_constant: default_timing_constant(),
            latency_upper_bound: default_latency_upper_bound(),
        }
    }
}

impl PenaltyConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.playing_exponent > 0.0 && self.playing_exponent <= 1.0) {
            return Err("penalty.playing_exponent must be in (0, 1]".to_string());
        }
        if self.playing_weight <= 0.0 {
            return Err("penalty.playing_weight must be > 0".to_string());
        }
        if self.cpu_constant <= 0.0 || self.timing_constant <= 0.0 {
            return Err("penalty curve constants must be > 0".to_string());
        }
        if self.latency_upper_bound.is_zero() {
            return Err("penalty.latency_upper_bound must be > 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Buffer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffered audio per session when its configuration names none.
    ///
    /// Default: 3s
    #[serde(default = "default_buffer_duration")]
    pub default_duration: Duration,

    /// Initial volume of new sessions (0 to 1000, 100 is unity gain).
    #[serde(default = "default_volume")]
    pub default_volume: u16,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_duration: default_buffer_duration(),
            default_volume: default_volume(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_duration.is_zero() {
            return Err("buffer.default_duration must be > 0".to_string());
        }
        if self.default_volume > crate::session::MAX_VOLUME {
            return Err(format!(
                "buffer.default_volume must be <= {}",
                crate::session::MAX_VOLUME
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_min_sleep() -> Duration {
    Duration::from_millis(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(1500)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_tick_path() -> String {
    "/tick".to_string()
}

fn default_history_size() -> usize {
    200
}

fn default_short_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_medium_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_long_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_medium_after() -> u32 {
    5
}

fn default_long_after() -> u32 {
    20
}

fn default_kill_threshold() -> Duration {
    Duration::from_secs(10)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_abandoned_capacity() -> usize {
    2000
}

fn default_expiry() -> Duration {
    Duration::from_secs(10)
}

fn default_critical_penalty() -> u32 {
    750
}

fn default_min_quota() -> u32 {
    5
}

fn default_quota_divisor() -> u32 {
    15
}

fn default_playing_linear_limit() -> u32 {
    100
}

fn default_playing_exponent() -> f64 {
    0.7
}

fn default_playing_weight() -> f64 {
    1.5
}

fn default_cpu_constant() -> f64 {
    10.0
}

fn default_timing_constant() -> f64 {
    10.0
}

fn default_latency_upper_bound() -> Duration {
    Duration::from_millis(1500)
}

fn default_buffer_duration() -> Duration {
    Duration::from_secs(3)
}

fn default_volume() -> u16 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RemoteConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick.interval, Duration::from_millis(500));
        assert_eq!(config.abandonment.capacity, 2000);
        assert_eq!(config.health.kill_threshold, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_tiers() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(19), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(20), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(500), Duration::from_secs(10));
    }

    #[test]
    fn test_quota_ramp() {
        let abandonment = AbandonmentConfig::default();
        assert_eq!(abandonment.quota_for(0), 5);
        assert_eq!(abandonment.quota_for(74), 5);
        assert_eq!(abandonment.quota_for(150), 10);
    }

    #[test]
    fn test_sleep_after_respects_floor() {
        let tick = TickConfig::default();
        assert_eq!(
            tick.sleep_after(Duration::from_millis(120)),
            Duration::from_millis(380)
        );
        assert_eq!(
            tick.sleep_after(Duration::from_millis(900)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RemoteConfig::default();
        config.abandonment.quota_divisor = 0;
        assert!(matches!(
            config.validate(),
            Err(RemoteError::InvalidConfig(msg)) if msg.contains("quota_divisor")
        ));

        let mut config = RemoteConfig::default();
        config.tick.path = "tick".to_string();
        assert!(config.validate().is_err());

        let mut config = RemoteConfig::default();
        config.penalty.playing_exponent = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: RemoteConfig =
            serde_json::from_str(r#"{ "abandonment": { "capacity": 10 } }"#).unwrap();
        assert_eq!(config.abandonment.capacity, 10);
        assert_eq!(config.abandonment.expiry, Duration::from_secs(10));
        assert_eq!(config.tick, TickConfig::default());
    }
}
