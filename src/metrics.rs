//! Running distance, pace, grade, and elevation accumulation.
//!
//! Consumes filtered fixes one at a time. Distance only accumulates from
//! fixes that pass acceptance filters: horizontal accuracy below a maximum,
//! and displacement from the previous accepted fix above a jitter floor so
//! GPS scatter at a standstill does not creep into the total. Pace is a
//! rolling trailing-window average rather than an instantaneous derivative.
//! Elevation gain and loss are counted against the last counted level with
//! a small noise-floor band: barometric jitter inside the band accumulates
//! nothing, while a slow steady ramp is still credited once it climbs past
//! the band.

use std::collections::VecDeque;

use log::debug;

use crate::geo_utils::fix_distance;
use crate::LocationFix;

/// Configuration for the metrics accumulator.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Fixes with horizontal accuracy above this (meters) are rejected.
    /// Default: 20.0
    pub max_horizontal_accuracy: f64,

    /// Displacement below this (meters) is treated as standstill jitter
    /// and accumulates no distance. Default: 1.0
    pub min_displacement: f64,

    /// Trailing window for the rolling pace average, in milliseconds.
    /// Default: 10_000
    pub pace_window_ms: i64,

    /// Elevation must move this far (meters) from the last counted level
    /// before gain or loss is credited. Default: 0.25
    pub elevation_noise_floor: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_horizontal_accuracy: 20.0,
            min_displacement: 1.0,
            pace_window_ms: 10_000,
            elevation_noise_floor: 0.25,
        }
    }
}

/// Whether a fix contributed to the accumulated metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixAcceptance {
    /// Distance, pace, grade, and elevation were updated
    Accepted,
    /// Below the jitter floor; pace window advanced, nothing accumulated
    Jitter,
    /// Failed the accuracy filter; counted, nothing touched
    Rejected,
}

/// Accumulates session totals from the accepted fix stream.
#[derive(Debug)]
pub struct MetricsAccumulator {
    config: MetricsConfig,
    total_distance: f64,
    last_accepted: Option<(LocationFix, f64)>,
    /// (timestamp_ms, cumulative distance) samples inside the pace window
    pace_samples: VecDeque<(i64, f64)>,
    current_grade: f64,
    /// Elevation at which gain/loss was last credited
    counted_elevation: Option<f64>,
    elevation_gain: f64,
    elevation_loss: f64,
    rejected_count: u64,
}

impl MetricsAccumulator {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            total_distance: 0.0,
            last_accepted: None,
            pace_samples: VecDeque::new(),
            current_grade: 0.0,
            counted_elevation: None,
            elevation_gain: 0.0,
            elevation_loss: 0.0,
            rejected_count: 0,
        }
    }

    /// Feed one fix with its fused elevation.
    ///
    /// Returns how the fix was treated. Distance is monotonically
    /// non-decreasing across any sequence of calls.
    pub fn update(&mut self, fix: &LocationFix, fused_elevation: f64) -> FixAcceptance {
        if fix.horizontal_accuracy > self.config.max_horizontal_accuracy {
            self.rejected_count += 1;
            debug!(
                "Fix rejected: horizontal accuracy {:.1}m exceeds {:.1}m",
                fix.horizontal_accuracy, self.config.max_horizontal_accuracy
            );
            return FixAcceptance::Rejected;
        }

        let Some((prev_fix, prev_elevation)) = self.last_accepted else {
            self.last_accepted = Some((*fix, fused_elevation));
            self.counted_elevation = Some(fused_elevation);
            self.push_pace_sample(fix.timestamp_ms);
            return FixAcceptance::Accepted;
        };

        let displacement = fix_distance(&prev_fix, fix);
        if displacement < self.config.min_displacement {
            // Standstill jitter: advance the pace window so pace decays
            // toward zero, but accumulate nothing
            self.push_pace_sample(fix.timestamp_ms);
            return FixAcceptance::Jitter;
        }

        self.total_distance += displacement;

        self.current_grade = (fused_elevation - prev_elevation) / displacement;

        // Credit gain/loss only once the elevation has moved a full noise
        // band away from the last counted level; jitter inside the band
        // accumulates nothing, a slow ramp is still credited in full
        let counted = self.counted_elevation.get_or_insert(fused_elevation);
        let banked_delta = fused_elevation - *counted;
        if banked_delta.abs() >= self.config.elevation_noise_floor {
            if banked_delta > 0.0 {
                self.elevation_gain += banked_delta;
            } else {
                self.elevation_loss += -banked_delta;
            }
            *counted = fused_elevation;
        }

        self.last_accepted = Some((*fix, fused_elevation));
        self.push_pace_sample(fix.timestamp_ms);
        FixAcceptance::Accepted
    }

    /// Forget the displacement and elevation references so the next
    /// accepted fix starts a new segment instead of measuring against the
    /// last fix before a gap. Called across manual pauses, where the user
    /// may have relocated without the session seeing any fixes.
    pub fn reset_reference(&mut self) {
        self.last_accepted = None;
        self.counted_elevation = None;
    }

    /// Total accumulated distance in meters.
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    /// Rolling-window average speed in m/s over the trailing pace window.
    pub fn current_pace(&self) -> f64 {
        let (Some(&(t_first, d_first)), Some(&(t_last, d_last))) =
            (self.pace_samples.front(), self.pace_samples.back())
        else {
            return 0.0;
        };
        let dt_s = (t_last - t_first) as f64 / 1000.0;
        if dt_s <= 0.0 {
            return 0.0;
        }
        (d_last - d_first) / dt_s
    }

    /// Grade (rise over run) between the two most recent accepted fixes.
    pub fn current_grade(&self) -> f64 {
        self.current_grade
    }

    /// Total elevation gained in meters (positive deltas only).
    pub fn elevation_gain(&self) -> f64 {
        self.elevation_gain
    }

    /// Total elevation lost in meters (absolute value of negative deltas).
    pub fn elevation_loss(&self) -> f64 {
        self.elevation_loss
    }

    /// Number of fixes rejected by the acceptance filters.
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }

    fn push_pace_sample(&mut self, timestamp_ms: i64) {
        self.pace_samples.push_back((timestamp_ms, self.total_distance));
        let cutoff = timestamp_ms - self.config.pace_window_ms;
        while self
            .pace_samples
            .front()
            .map_or(false, |&(t, _)| t < cutoff)
        {
            self.pace_samples.pop_front();
        }
    }
}
