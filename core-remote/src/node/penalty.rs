//! # Load Scoring
//!
//! A node's penalty is the sum of four curves. Each one is monotonic and
//! the CPU and timing curves diverge as their input saturates, so a node
//! close to its limits is avoided long before it is unusable.

use serde::Serialize;
use std::time::Duration;

use crate::config::PenaltyConfig;
use crate::protocol::NodeStatistics;

/// Penalty of a node that must not receive work.
pub const MAX_PENALTY: u32 = u32::MAX;

const MAX_UTILIZATION: f64 = 0.999;

/// Breakdown of a node's penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PenaltyDetails {
    pub playing: f64,
    pub paused: f64,
    pub cpu: f64,
    pub timing: f64,
}

impl PenaltyDetails {
    pub fn compute(stats: &NodeStatistics, latency: Duration, config: &PenaltyConfig) -> Self {
        Self {
            playing: playing_penalty(stats.playing_tracks, config),
            paused: f64::from(stats.total_tracks.saturating_sub(stats.playing_tracks)),
            cpu: saturation_penalty(f64::from(stats.system_cpu), config.cpu_constant),
            timing: timing_penalty(latency, config),
        }
    }

    /// Rounded sum, saturating below [`MAX_PENALTY`].
    pub fn total(&self) -> u32 {
        let sum = self.playing + self.paused + self.cpu + self.timing;
        if !sum.is_finite() || sum >= f64::from(MAX_PENALTY - 1) {
            return MAX_PENALTY - 1;
        }
        sum.round().max(0.0) as u32
    }
}

/// Linear up to the limit, sub-linear beyond it, then weighted.
pub fn playing_penalty(playing: u32, config: &PenaltyConfig) -> f64 {
    let count = f64::from(playing);
    let limit = f64::from(config.playing_linear_limit);
    let effective = if count <= limit {
        count
    } else {
        limit + (count - limit).powf(config.playing_exponent)
    };
    effective * config.playing_weight
}

/// `k / (1 - u) - k`: zero when idle, diverging as `u` approaches 1.
pub fn saturation_penalty(utilization: f64, k: f64) -> f64 {
    let u = if utilization.is_nan() {
        0.0
    } else {
        utilization.clamp(0.0, MAX_UTILIZATION)
    };
    k / (1.0 - u) - k
}

pub fn timing_penalty(latency: Duration, config: &PenaltyConfig) -> f64 {
    let ratio = latency.as_secs_f64() / config.latency_upper_bound.as_secs_f64();
    saturation_penalty(ratio, config.timing_constant)
}

/// Fold a new tick latency into the smoothed average.
///
/// The sample's weight grows with the square of its share of the upper
/// bound: fast ticks barely move the average, slow ones dominate it.
pub fn smooth_latency(previous: Duration, sample: Duration, config: &PenaltyConfig) -> Duration {
    let upper = config.latency_upper_bound.as_secs_f64();
    let sample_secs = sample.as_secs_f64().min(upper);
    let share = sample_secs / upper;
    let weight = (0.1 + 0.9 * share * share).min(1.0);
    let smoothed = previous.as_secs_f64() * (1.0 - weight) + sample_secs * weight;
    Duration::from_secs_f64(smoothed.max(0.0))
}
