//! Adaptive positioning accuracy and update frequency control.
//!
//! Chooses the desired positioning accuracy tier and update frequency from
//! the current movement pattern, battery level, and low-power mode, then
//! reconfigures the raw positioning source. Faster movement earns higher
//! frequency and accuracy; a stationary or auto-paused session drops to a
//! floor rate; low battery or low-power mode forces a degraded tier
//! regardless of movement.
//!
//! Reconfigurations apply with hysteresis (a minimum dwell time between
//! changes) so a speed hovering on a pattern boundary cannot thrash the
//! positioning hardware.

use std::collections::VecDeque;

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Movement pattern derived from recent speed and acceleration activity,
/// independent of terrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementPattern {
    Stationary,
    Walking,
    Running,
    Cycling,
    Automotive,
}

/// Desired positioning accuracy tier applied to the raw source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyTier {
    /// Best available accuracy, highest power draw
    Best,
    /// ~10 m accuracy
    TenMeters,
    /// ~100 m accuracy, lowest power draw
    HundredMeters,
}

impl AccuracyTier {
    /// Requested accuracy radius in meters for this tier.
    pub fn desired_accuracy_m(&self) -> f64 {
        match self {
            AccuracyTier::Best => 5.0,
            AccuracyTier::TenMeters => 10.0,
            AccuracyTier::HundredMeters => 100.0,
        }
    }

    /// Rough receiver power draw in milliwatts, used for the battery
    /// usage estimate surfaced in session snapshots.
    fn power_mw(&self) -> f64 {
        match self {
            AccuracyTier::Best => 45.0,
            AccuracyTier::TenMeters => 25.0,
            AccuracyTier::HundredMeters => 8.0,
        }
    }
}

/// A tier + frequency pair applied to the positioning source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingDecision {
    pub tier: AccuracyTier,
    /// Update frequency in Hz (0.2–10)
    pub frequency_hz: f64,
}

/// Battery level and power-mode input from the power collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    /// Battery level in 0..1
    pub level: f64,
    pub low_power_mode: bool,
}

impl Default for PowerState {
    fn default() -> Self {
        Self {
            level: 1.0,
            low_power_mode: false,
        }
    }
}

/// Configuration for the adaptive sampling controller.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Battery level below which the degraded tier is forced.
    /// Default: 0.2
    pub low_battery_threshold: f64,

    /// Minimum dwell between reconfigurations, in milliseconds.
    /// Default: 5000
    pub min_dwell_ms: i64,

    /// Number of recent speed observations used for pattern classification.
    /// Default: 5
    pub speed_window: usize,

    /// Speed boundaries (m/s) between patterns:
    /// stationary/walking, walking/running, running/cycling, cycling/automotive.
    /// Default: [0.3, 2.2, 4.5, 9.0]
    pub pattern_boundaries: [f64; 4],

    /// Update frequency per pattern, stationary through automotive, in Hz.
    /// Default: [0.2, 1.0, 2.0, 5.0, 10.0]
    pub pattern_frequencies: [f64; 5],

    /// Frequency used when the degraded tier is forced. Default: 0.5
    pub degraded_frequency_hz: f64,

    /// Number of recent acceleration magnitudes kept for the activity
    /// signal. Default: 64 (about 1.3s at 50 Hz)
    pub accel_window: usize,

    /// RMS acceleration magnitude (m/s²) above which a stationary-speed
    /// window still counts as walking movement. Default: 0.35
    pub motion_activity_threshold: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            low_battery_threshold: 0.2,
            min_dwell_ms: 5000,
            speed_window: 5,
            pattern_boundaries: [0.3, 2.2, 4.5, 9.0],
            pattern_frequencies: [0.2, 1.0, 2.0, 5.0, 10.0],
            degraded_frequency_hz: 0.5,
            accel_window: 64,
            motion_activity_threshold: 0.35,
        }
    }
}

/// Adaptive sampling controller.
///
/// Feed it speed observations and power state; it exposes the current
/// `SamplingDecision` and reports when a reconfiguration of the raw source
/// is required.
#[derive(Debug)]
pub struct AdaptiveSamplingController {
    config: SamplingConfig,
    recent_speeds: VecDeque<f64>,
    recent_accel: VecDeque<f64>,
    pattern: MovementPattern,
    power: PowerState,
    auto_paused: bool,

    current: SamplingDecision,
    last_change_ms: Option<i64>,

    // Battery usage accounting
    usage_mwh: f64,
    last_usage_ms: Option<i64>,
}

impl AdaptiveSamplingController {
    pub fn new(config: SamplingConfig) -> Self {
        let current = SamplingDecision {
            tier: AccuracyTier::Best,
            frequency_hz: config.pattern_frequencies[1],
        };
        Self {
            config,
            recent_speeds: VecDeque::new(),
            recent_accel: VecDeque::new(),
            pattern: MovementPattern::Walking,
            power: PowerState::default(),
            auto_paused: false,
            current,
            last_change_ms: None,
            usage_mwh: 0.0,
            last_usage_ms: None,
        }
    }

    /// Record a speed observation and re-evaluate the decision.
    ///
    /// Returns the new decision if a reconfiguration was issued, or `None`
    /// if the current decision stands (unchanged, or inside the dwell
    /// window).
    pub fn observe(&mut self, timestamp_ms: i64, speed: f64) -> Option<SamplingDecision> {
        self.accrue_usage(timestamp_ms);

        if speed.is_finite() && speed >= 0.0 {
            self.recent_speeds.push_back(speed);
            while self.recent_speeds.len() > self.config.speed_window {
                self.recent_speeds.pop_front();
            }
        }
        self.pattern = self.classify_pattern();

        let within_dwell = self
            .last_change_ms
            .is_some_and(|t| timestamp_ms - t < self.config.min_dwell_ms);
        if within_dwell {
            return None;
        }
        self.apply_decision(timestamp_ms)
    }

    /// Record a motion sample's acceleration magnitude.
    ///
    /// GPS speed pins near zero during a slow shuffle; sustained
    /// acceleration activity keeps such a window classified as walking
    /// rather than dropping the positioning rate to the stationary floor.
    pub fn observe_motion(&mut self, acceleration: [f64; 3]) {
        let magnitude = acceleration.iter().map(|a| a * a).sum::<f64>().sqrt();
        if !magnitude.is_finite() {
            return;
        }
        self.recent_accel.push_back(magnitude);
        while self.recent_accel.len() > self.config.accel_window {
            self.recent_accel.pop_front();
        }
    }

    /// Update battery level and low-power mode.
    pub fn set_power_state(&mut self, power: PowerState) {
        self.power = power;
    }

    /// Tell the controller whether the session is auto-paused, which floors
    /// the update frequency until movement resumes.
    pub fn set_auto_paused(&mut self, auto_paused: bool) {
        self.auto_paused = auto_paused;
    }

    /// Immediately re-evaluate, bypassing the dwell window.
    pub fn force_update(&mut self, timestamp_ms: i64) -> SamplingDecision {
        self.accrue_usage(timestamp_ms);
        self.pattern = self.classify_pattern();
        self.apply_decision(timestamp_ms);
        self.current
    }

    /// The decision currently applied to the positioning source.
    pub fn current(&self) -> SamplingDecision {
        self.current
    }

    /// The movement pattern behind the current decision.
    pub fn pattern(&self) -> MovementPattern {
        self.pattern
    }

    /// Estimated positioning energy spent so far, in milliwatt-hours.
    pub fn battery_usage_estimate(&self) -> f64 {
        self.usage_mwh
    }

    fn classify_pattern(&self) -> MovementPattern {
        if self.recent_speeds.is_empty() {
            return MovementPattern::Stationary;
        }
        let avg = self.recent_speeds.iter().sum::<f64>() / self.recent_speeds.len() as f64;
        let [b0, b1, b2, b3] = self.config.pattern_boundaries;
        if avg < b0 {
            if self.accel_rms() > self.config.motion_activity_threshold {
                MovementPattern::Walking
            } else {
                MovementPattern::Stationary
            }
        } else if avg < b1 {
            MovementPattern::Walking
        } else if avg < b2 {
            MovementPattern::Running
        } else if avg < b3 {
            MovementPattern::Cycling
        } else {
            MovementPattern::Automotive
        }
    }

    fn accel_rms(&self) -> f64 {
        if self.recent_accel.is_empty() {
            return 0.0;
        }
        let mean_sq =
            self.recent_accel.iter().map(|a| a * a).sum::<f64>() / self.recent_accel.len() as f64;
        mean_sq.sqrt()
    }

    /// Compute the desired decision for the current inputs.
    fn desired_decision(&self) -> SamplingDecision {
        let degraded = self.power.low_power_mode
            || self.power.level < self.config.low_battery_threshold;
        if degraded {
            return SamplingDecision {
                tier: AccuracyTier::HundredMeters,
                frequency_hz: self.config.degraded_frequency_hz,
            };
        }

        if self.auto_paused {
            return SamplingDecision {
                tier: AccuracyTier::TenMeters,
                frequency_hz: self.config.pattern_frequencies[0],
            };
        }

        let (tier, idx) = match self.pattern {
            MovementPattern::Stationary => (AccuracyTier::TenMeters, 0),
            MovementPattern::Walking => (AccuracyTier::Best, 1),
            MovementPattern::Running => (AccuracyTier::Best, 2),
            MovementPattern::Cycling => (AccuracyTier::Best, 3),
            MovementPattern::Automotive => (AccuracyTier::TenMeters, 4),
        };
        SamplingDecision {
            tier,
            frequency_hz: self.config.pattern_frequencies[idx],
        }
    }

    fn apply_decision(&mut self, timestamp_ms: i64) -> Option<SamplingDecision> {
        let desired = self.desired_decision();
        if desired == self.current {
            return None;
        }
        debug!(
            "Sampling reconfiguration: {:?} -> {:?} (pattern {:?}, battery {:.0}%)",
            self.current,
            desired,
            self.pattern,
            self.power.level * 100.0
        );
        self.current = desired;
        self.last_change_ms = Some(timestamp_ms);
        Some(desired)
    }

    /// Integrate receiver power draw over wall time at the current tier.
    fn accrue_usage(&mut self, timestamp_ms: i64) {
        if let Some(last) = self.last_usage_ms {
            let dt_ms = (timestamp_ms - last).max(0);
            self.usage_mwh += self.current.tier.power_mw() * dt_ms as f64 / 3_600_000.0;
        }
        self.last_usage_ms = Some(timestamp_ms);
    }

    /// Reset usage accounting at session start.
    pub fn reset_usage(&mut self, timestamp_ms: i64) {
        self.usage_mwh = 0.0;
        self.last_usage_ms = Some(timestamp_ms);
        info!("Sampling controller armed at t={}ms", timestamp_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveSamplingController {
        AdaptiveSamplingController::new(SamplingConfig::default())
    }

    #[test]
    fn test_walking_speed_selects_walking_rate() {
        let mut c = controller();
        for i in 0..5 {
            c.observe(i * 1000 + 10_000, 1.3);
        }
        let decision = c.force_update(20_000);
        assert_eq!(c.pattern(), MovementPattern::Walking);
        assert_eq!(decision.tier, AccuracyTier::Best);
        assert!((decision.frequency_hz - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stationary_drops_to_floor() {
        let mut c = controller();
        for i in 0..5 {
            c.observe(i * 1000, 0.05);
        }
        let decision = c.force_update(10_000);
        assert_eq!(c.pattern(), MovementPattern::Stationary);
        assert!((decision.frequency_hz - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_motion_activity_overrides_stationary_speed() {
        let mut c = controller();
        // GPS speed pinned near zero while footfall acceleration persists
        for i in 0..5 {
            c.observe(i * 1000, 0.05);
        }
        for i in 0..64 {
            let a = 0.8 * (i as f64 * 0.2).sin();
            c.observe_motion([0.0, 0.0, a]);
        }
        let decision = c.force_update(10_000);
        assert_eq!(c.pattern(), MovementPattern::Walking);
        assert!((decision.frequency_hz - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_low_battery_forces_degraded_tier() {
        let mut c = controller();
        for i in 0..5 {
            c.observe(i * 1000, 3.0); // running
        }
        c.set_power_state(PowerState {
            level: 0.1,
            low_power_mode: false,
        });
        let decision = c.force_update(10_000);
        assert_eq!(decision.tier, AccuracyTier::HundredMeters);
        assert!((decision.frequency_hz - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_low_power_mode_forces_degraded_tier() {
        let mut c = controller();
        c.set_power_state(PowerState {
            level: 0.9,
            low_power_mode: true,
        });
        let decision = c.force_update(0);
        assert_eq!(decision.tier, AccuracyTier::HundredMeters);
    }

    #[test]
    fn test_hysteresis_blocks_rapid_changes() {
        let mut c = controller();
        // Establish a walking decision
        for i in 0..5 {
            c.observe(i * 100, 1.3);
        }
        c.force_update(500);
        let before = c.current();

        // A burst of running speeds right after must not reconfigure
        // within the dwell window
        for i in 0..5 {
            let changed = c.observe(600 + i * 100, 4.0);
            assert!(changed.is_none());
        }
        assert_eq!(c.current(), before);

        // After the dwell expires the change goes through
        let changed = c.observe(before_dwell_end(&c), 4.0);
        assert!(changed.is_some());
    }

    fn before_dwell_end(c: &AdaptiveSamplingController) -> i64 {
        // Well past the 5s default dwell
        500 + c.config.min_dwell_ms + 1000
    }

    #[test]
    fn test_auto_pause_floors_frequency() {
        let mut c = controller();
        for i in 0..5 {
            c.observe(i * 1000, 1.3);
        }
        c.set_auto_paused(true);
        let decision = c.force_update(10_000);
        assert!((decision.frequency_hz - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_battery_usage_accumulates() {
        let mut c = controller();
        c.reset_usage(0);
        for i in 1..=60 {
            c.observe(i * 1000, 1.3);
        }
        assert!(c.battery_usage_estimate() > 0.0);
    }
}
