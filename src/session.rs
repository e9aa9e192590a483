//! Session state machine and per-fix processing pipeline.
//!
//! `SessionStateMachine` owns every per-fix component (adaptive sampling
//! controller, elevation fusion engine, terrain classifier, compressor) and
//! the working `TrackingSession` created on `start()`. Exactly one in-order
//! stream of fixes drives all of them; see `tracker` for the concurrency
//! shell that enforces the single-writer discipline.
//!
//! ## States
//!
//! `Stopped` (initial/terminal), `Tracking`, `Paused` (user-initiated),
//! and `AutoPaused` (movement-based). Auto-pause is internal: while
//! tracking, a window with cumulative displacement below a floor for longer
//! than an idle threshold pauses the session without user action, and the
//! next fix showing real displacement resumes it. A manual pause is never
//! auto-resumed. Invalid lifecycle calls return an error and leave state
//! untouched.

use log::{debug, info, warn};
use serde::Serialize;

use crate::compress::{CompressionConfig, TrackCompressor};
use crate::elevation::{ElevationConfig, ElevationFusionEngine};
use crate::error::{Result, TrackError};
use crate::geo_utils::fix_distance;
use crate::metrics::{FixAcceptance, MetricsAccumulator, MetricsConfig};
use crate::sampling::{AdaptiveSamplingController, PowerState, SamplingConfig};
use crate::terrain::{
    TerrainChange, TerrainClassification, TerrainClassifier, TerrainConfig, TerrainType,
};
use crate::{EnrichedPoint, LocationFix, MotionSample};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Stopped,
    Tracking,
    Paused,
    AutoPaused,
}

/// Session-level configuration (auto-pause policy, buffer cap).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time without significant movement before auto-pause, in
    /// milliseconds. Default: 40_000
    pub auto_pause_idle_ms: i64,

    /// Cumulative displacement below this (meters) over the idle window
    /// counts as "no significant movement". Default: 2.5
    pub auto_pause_displacement_m: f64,

    /// Live point buffer cap; when exceeded, the oldest half is compacted
    /// in place with the compressor. Default: 50_000
    pub live_buffer_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_pause_idle_ms: 40_000,
            auto_pause_displacement_m: 2.5,
            live_buffer_cap: 50_000,
        }
    }
}

/// Bundled configuration for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub session: SessionConfig,
    pub sampling: SamplingConfig,
    pub elevation: ElevationConfig,
    pub terrain: TerrainConfig,
    pub metrics: MetricsConfig,
    pub compression: CompressionConfig,
}

/// Working state of one activity: created on `start()`, mutated only by the
/// owning state machine, finalized and consumed on `stop()`.
struct TrackingSession {
    start_ms: i64,

    /// Tracked duration, excluding paused and auto-paused intervals
    tracked_ms: i64,
    last_event_ms: i64,

    /// Position and time of the last significant movement (auto-pause)
    anchor_fix: Option<LocationFix>,
    last_movement_ms: i64,

    /// Monotonic timestamp enforcement
    last_fix_ms: Option<i64>,

    metrics: MetricsAccumulator,

    /// Ordered, append-only buffer of enriched fixes
    points: Vec<EnrichedPoint>,
    /// Total points ever appended, including those removed by compaction
    appended_count: usize,
    invalid_fix_count: u64,
}

impl TrackingSession {
    fn new(timestamp_ms: i64, metrics_config: MetricsConfig) -> Self {
        Self {
            start_ms: timestamp_ms,
            tracked_ms: 0,
            last_event_ms: timestamp_ms,
            anchor_fix: None,
            last_movement_ms: timestamp_ms,
            last_fix_ms: None,
            metrics: MetricsAccumulator::new(metrics_config),
            points: Vec::new(),
            appended_count: 0,
            invalid_fix_count: 0,
        }
    }

    /// Accrue tracked duration up to `now`. Only called while `Tracking`.
    fn accrue_to(&mut self, now_ms: i64) {
        self.tracked_ms += (now_ms - self.last_event_ms).max(0);
        self.last_event_ms = now_ms;
    }

    /// Restart the accrual clock without counting the elapsed gap.
    fn mark_event(&mut self, now_ms: i64) {
        self.last_event_ms = now_ms;
    }
}

/// Immutable snapshot of the session, safe to hand to readers while the
/// writer keeps processing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub start_ms: Option<i64>,
    /// Tracked duration in milliseconds, excluding paused and auto-paused
    /// intervals
    pub elapsed_tracked_ms: i64,
    /// Total accumulated distance in meters
    pub total_distance: f64,
    /// Rolling-window average speed in m/s
    pub current_pace: f64,
    /// Grade between the two most recent accepted fixes
    pub current_grade: f64,
    pub elevation_gain: f64,
    pub elevation_loss: f64,
    pub current_terrain: TerrainType,
    /// Calorie multiplier for the current terrain
    pub current_terrain_factor: f64,
    pub terrain_confidence: f64,
    /// Estimated positioning energy spent, in milliwatt-hours
    pub battery_usage_estimate: f64,
    pub point_count: usize,
    pub rejected_fix_count: u64,
}

/// The finalized, compressed output of a stopped session.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedSession {
    /// Compressed enriched point sequence, endpoints preserved
    pub points: Vec<EnrichedPoint>,
    /// Terrain change log for post-hoc segment reconstruction
    pub terrain_changes: Vec<TerrainChange>,
    /// Total points appended over the session, before compression
    pub original_point_count: usize,
    /// Compressed/original ratio
    pub compression_ratio: f64,
    /// Final metrics snapshot at stop time
    pub snapshot: SessionSnapshot,
}

/// Auto-pause decision computed under the session borrow, applied after.
enum AutoPauseAction {
    Resume,
    Pause,
}

/// Orchestrates session lifecycle and the per-fix pipeline.
pub struct SessionStateMachine {
    config: TrackerConfig,
    state: SessionState,
    session: Option<TrackingSession>,

    sampling: AdaptiveSamplingController,
    elevation: ElevationFusionEngine,
    terrain: TerrainClassifier,
    compressor: TrackCompressor,
}

impl SessionStateMachine {
    pub fn new(config: TrackerConfig) -> Self {
        let sampling = AdaptiveSamplingController::new(config.sampling.clone());
        let elevation = ElevationFusionEngine::new(config.elevation.clone());
        let terrain = TerrainClassifier::new(config.terrain.clone());
        let compressor = TrackCompressor::new(config.compression.clone());
        Self {
            config,
            state: SessionState::Stopped,
            session: None,
            sampling,
            elevation,
            terrain,
            compressor,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a new session. Only valid from `Stopped`.
    pub fn start(&mut self, timestamp_ms: i64) -> Result<()> {
        if self.state != SessionState::Stopped {
            return Err(TrackError::InvalidTransition {
                from: self.state,
                attempted: "start",
            });
        }

        // Fresh component state for the new session
        self.elevation = ElevationFusionEngine::new(self.config.elevation.clone());
        self.terrain = TerrainClassifier::new(self.config.terrain.clone());
        self.sampling = AdaptiveSamplingController::new(self.config.sampling.clone());
        self.session = Some(TrackingSession::new(
            timestamp_ms,
            self.config.metrics.clone(),
        ));

        self.state = SessionState::Tracking;
        self.sampling.reset_usage(timestamp_ms);
        self.sampling.force_update(timestamp_ms);
        info!("Session started at t={}ms", timestamp_ms);
        Ok(())
    }

    /// User-initiated pause. Valid from `Tracking` and `AutoPaused`; a
    /// manual pause takes precedence over auto-pause and is never
    /// auto-resumed.
    pub fn pause(&mut self, timestamp_ms: i64) -> Result<()> {
        match self.state {
            SessionState::Tracking | SessionState::AutoPaused => {
                if self.state == SessionState::Tracking {
                    if let Some(sess) = self.session.as_mut() {
                        sess.accrue_to(timestamp_ms);
                    }
                }
                self.state = SessionState::Paused;
                self.sampling.set_auto_paused(true);
                info!("Session paused at t={}ms", timestamp_ms);
                Ok(())
            }
            from => Err(TrackError::InvalidTransition {
                from,
                attempted: "pause",
            }),
        }
    }

    /// Resume from a user-initiated pause. Only valid from `Paused`.
    pub fn resume(&mut self, timestamp_ms: i64) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(TrackError::InvalidTransition {
                from: self.state,
                attempted: "resume",
            });
        }
        if let Some(sess) = self.session.as_mut() {
            sess.mark_event(timestamp_ms);
            sess.last_movement_ms = timestamp_ms;
            sess.anchor_fix = None;
            // The user may have relocated while paused; the next fix must
            // start a new segment, not measure against the pre-pause fix
            sess.metrics.reset_reference();
        }
        self.state = SessionState::Tracking;
        self.sampling.set_auto_paused(false);
        info!("Session resumed at t={}ms", timestamp_ms);
        Ok(())
    }

    /// Stop and finalize the session: freeze accumulation, compress the
    /// point buffer, and release sampling resources. Valid from any state
    /// except `Stopped`.
    pub fn stop(&mut self, timestamp_ms: i64) -> Result<FinalizedSession> {
        let Some(mut sess) = self.session.take() else {
            return Err(TrackError::InvalidTransition {
                from: self.state,
                attempted: "stop",
            });
        };
        if self.state == SessionState::Tracking {
            sess.accrue_to(timestamp_ms);
        }
        self.state = SessionState::Stopped;

        let snapshot = self.snapshot_of(Some(&sess), SessionState::Stopped);
        let result = self
            .compressor
            .compress(&sess.points, self.terrain.change_log());
        info!(
            "Session stopped: {:.0}m over {}s, {} -> {} points",
            snapshot.total_distance,
            snapshot.elapsed_tracked_ms / 1000,
            sess.appended_count,
            result.compressed_count
        );

        Ok(FinalizedSession {
            compression_ratio: if sess.appended_count == 0 {
                1.0
            } else {
                result.compressed_count as f64 / sess.appended_count as f64
            },
            points: result.points,
            terrain_changes: self.terrain.change_log().to_vec(),
            original_point_count: sess.appended_count,
            snapshot,
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    // ========================================================================
    // Per-fix pipeline
    // ========================================================================

    /// Process one positioning fix.
    ///
    /// Returns `true` if the fix was enriched and appended to the point
    /// buffer. Invalid fixes are counted and dropped, never propagated as
    /// errors; fixes arriving while `Paused` or `Stopped` are ignored.
    pub fn process_fix(&mut self, fix: LocationFix) -> bool {
        if matches!(self.state, SessionState::Stopped | SessionState::Paused) {
            return false;
        }
        {
            let Some(sess) = self.session.as_mut() else {
                return false;
            };
            if !fix.is_valid() {
                sess.invalid_fix_count += 1;
                debug!("Invalid fix dropped (count {})", sess.invalid_fix_count);
                return false;
            }
            if sess.last_fix_ms.is_some_and(|last| fix.timestamp_ms < last) {
                sess.invalid_fix_count += 1;
                warn!("Non-monotonic fix timestamp {}, dropped", fix.timestamp_ms);
                return false;
            }
            sess.last_fix_ms = Some(fix.timestamp_ms);
        }

        self.sampling.observe(fix.timestamp_ms, fix.speed);
        let estimate = self.elevation.update(
            fix.timestamp_ms,
            None,
            Some((fix.altitude, fix.vertical_accuracy)),
        );

        self.evaluate_auto_pause(&fix);
        if self.state != SessionState::Tracking {
            return false;
        }

        let Self {
            session,
            terrain,
            compressor,
            config,
            ..
        } = self;
        let Some(sess) = session.as_mut() else {
            return false;
        };
        sess.accrue_to(fix.timestamp_ms);

        if sess.metrics.update(&fix, estimate.altitude) != FixAcceptance::Accepted {
            return false;
        }
        let grade = sess.metrics.current_grade();
        let classification = terrain.classify(fix.timestamp_ms, fix.speed, grade);

        sess.points.push(EnrichedPoint {
            fix,
            elevation: estimate,
            terrain: classification,
            grade,
        });
        sess.appended_count += 1;

        // Resource-exhaustion guard: compact the oldest half in place
        if sess.points.len() > config.session.live_buffer_cap {
            let half = sess.points.len() / 2;
            let result = compressor.compress(&sess.points[..half], terrain.change_log());
            debug!(
                "Live buffer compaction: {} -> {} points in oldest half",
                half, result.compressed_count
            );
            let tail = sess.points.split_off(half);
            sess.points = result.points;
            sess.points.extend(tail);
        }
        true
    }

    /// Feed a motion sample to the terrain classifier's window and the
    /// sampling controller's activity signal.
    pub fn process_motion(&mut self, sample: MotionSample) {
        if self.state != SessionState::Stopped {
            self.sampling.observe_motion(sample.acceleration);
            self.terrain.push_sample(sample);
        }
    }

    /// Feed a barometric pressure sample (hPa) to the elevation engine.
    pub fn process_pressure(&mut self, timestamp_ms: i64, pressure_hpa: f64) {
        if self.state != SessionState::Stopped {
            self.elevation.update_pressure(timestamp_ms, pressure_hpa);
        }
    }

    /// Forward battery level and power mode to the sampling controller.
    pub fn set_power_state(&mut self, power: PowerState) {
        self.sampling.set_power_state(power);
    }

    /// Reset the elevation filter against a trusted reference.
    pub fn calibrate_elevation(
        &mut self,
        known_elevation: f64,
        reference_pressure: f64,
    ) -> Result<()> {
        let range = self.config.elevation.min_altitude..=self.config.elevation.max_altitude;
        if !known_elevation.is_finite() || !range.contains(&known_elevation) {
            return Err(TrackError::ConfigError {
                message: format!("calibration elevation {} out of range", known_elevation),
            });
        }
        if !reference_pressure.is_finite() || reference_pressure <= 0.0 {
            return Err(TrackError::ConfigError {
                message: format!("reference pressure {} not positive", reference_pressure),
            });
        }
        self.elevation.calibrate(known_elevation, reference_pressure);
        Ok(())
    }

    /// Set a manual terrain override; pre-empts detection until cleared.
    pub fn set_terrain_override(&mut self, terrain: TerrainType, timestamp_ms: i64) {
        let grade = self
            .session
            .as_ref()
            .map_or(0.0, |s| s.metrics.current_grade());
        self.terrain.set_manual_override(terrain, timestamp_ms, grade);
    }

    /// Clear the manual terrain override.
    pub fn clear_terrain_override(&mut self, timestamp_ms: i64) {
        self.terrain.clear_manual_override(timestamp_ms);
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Immutable snapshot of the current session for readers.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_of(self.session.as_ref(), self.state)
    }

    /// The live (uncompressed) point buffer.
    pub fn points(&self) -> &[EnrichedPoint] {
        self.session.as_ref().map_or(&[], |s| &s.points)
    }

    /// The terrain change log so far.
    pub fn terrain_change_log(&self) -> &[TerrainChange] {
        self.terrain.change_log()
    }

    /// The most recent terrain classification.
    pub fn current_terrain(&self) -> TerrainClassification {
        self.terrain.current()
    }

    /// Replace a prefix of the live buffer with its compressed form.
    ///
    /// Used by the background compression task to merge results back in:
    /// `prefix_len` is the buffer length at the time the snapshot was
    /// taken, `compressed` its compressed replacement.
    pub fn merge_compacted_prefix(&mut self, prefix_len: usize, compressed: Vec<EnrichedPoint>) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if prefix_len > sess.points.len() || compressed.len() > prefix_len {
            warn!(
                "Stale compaction merge dropped ({} of {} live points)",
                prefix_len,
                sess.points.len()
            );
            return;
        }
        let tail = sess.points.split_off(prefix_len);
        sess.points = compressed;
        sess.points.extend(tail);
    }

    /// Diagnostic JSON dump of internal state for operational tooling.
    pub fn diagnostics(&self) -> String {
        #[derive(Serialize)]
        struct Diagnostics {
            state: SessionState,
            point_count: usize,
            appended_count: usize,
            invalid_fix_count: u64,
            metrics_rejected_count: u64,
            motion_window_len: usize,
            terrain_method_manual: bool,
            terrain_change_count: usize,
            elevation_initialized: bool,
            elevation_uncertainty: f64,
            elevation_stability: f64,
            sampling_frequency_hz: f64,
            battery_usage_mwh: f64,
        }
        let estimate = self.elevation.estimate();
        let sess = self.session.as_ref();
        let diag = Diagnostics {
            state: self.state,
            point_count: sess.map_or(0, |s| s.points.len()),
            appended_count: sess.map_or(0, |s| s.appended_count),
            invalid_fix_count: sess.map_or(0, |s| s.invalid_fix_count),
            metrics_rejected_count: sess.map_or(0, |s| s.metrics.rejected_count()),
            motion_window_len: self.terrain.window_len(),
            terrain_method_manual: self.terrain.has_manual_override(),
            terrain_change_count: self.terrain.change_log().len(),
            elevation_initialized: self.elevation.is_initialized(),
            elevation_uncertainty: estimate.uncertainty,
            elevation_stability: estimate.stability,
            sampling_frequency_hz: self.sampling.current().frequency_hz,
            battery_usage_mwh: self.sampling.battery_usage_estimate(),
        };
        serde_json::to_string(&diag).unwrap_or_else(|_| "{}".to_string())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn snapshot_of(&self, sess: Option<&TrackingSession>, state: SessionState) -> SessionSnapshot {
        let terrain = self.terrain.current();
        SessionSnapshot {
            state,
            start_ms: sess.map(|s| s.start_ms),
            elapsed_tracked_ms: sess.map_or(0, |s| s.tracked_ms),
            total_distance: sess.map_or(0.0, |s| s.metrics.total_distance()),
            current_pace: sess.map_or(0.0, |s| s.metrics.current_pace()),
            current_grade: sess.map_or(0.0, |s| s.metrics.current_grade()),
            elevation_gain: sess.map_or(0.0, |s| s.metrics.elevation_gain()),
            elevation_loss: sess.map_or(0.0, |s| s.metrics.elevation_loss()),
            current_terrain: terrain.terrain,
            current_terrain_factor: terrain.terrain.difficulty_factor(),
            terrain_confidence: terrain.confidence,
            battery_usage_estimate: self.sampling.battery_usage_estimate(),
            point_count: sess.map_or(0, |s| s.points.len()),
            rejected_fix_count: sess.map_or(0, |s| {
                s.invalid_fix_count + s.metrics.rejected_count()
            }),
        }
    }

    /// Auto-pause bookkeeping for one fix.
    ///
    /// Significant displacement refreshes the movement anchor and
    /// auto-resumes an auto-paused session; a quiet window longer than the
    /// idle threshold auto-pauses a tracking one. Manual pause is handled
    /// before this is ever reached.
    fn evaluate_auto_pause(&mut self, fix: &LocationFix) {
        let displacement_floor = self.config.session.auto_pause_displacement_m;
        let idle_limit_ms = self.config.session.auto_pause_idle_ms;
        let state = self.state;

        let action = {
            let Some(sess) = self.session.as_mut() else {
                return;
            };
            let Some(anchor) = sess.anchor_fix else {
                sess.anchor_fix = Some(*fix);
                sess.last_movement_ms = fix.timestamp_ms;
                return;
            };

            if fix_distance(&anchor, fix) > displacement_floor {
                sess.anchor_fix = Some(*fix);
                sess.last_movement_ms = fix.timestamp_ms;
                (state == SessionState::AutoPaused).then_some(AutoPauseAction::Resume)
            } else if state == SessionState::Tracking
                && fix.timestamp_ms - sess.last_movement_ms > idle_limit_ms
            {
                Some(AutoPauseAction::Pause)
            } else {
                None
            }
        };

        match action {
            Some(AutoPauseAction::Resume) => {
                // Movement resumes tracking without user action
                self.state = SessionState::Tracking;
                if let Some(sess) = self.session.as_mut() {
                    sess.mark_event(fix.timestamp_ms);
                }
                self.sampling.set_auto_paused(false);
                info!("Auto-resumed at t={}ms", fix.timestamp_ms);
            }
            Some(AutoPauseAction::Pause) => {
                if let Some(sess) = self.session.as_mut() {
                    sess.accrue_to(fix.timestamp_ms);
                }
                self.state = SessionState::AutoPaused;
                self.sampling.set_auto_paused(true);
                info!("Auto-paused at t={}ms", fix.timestamp_ms);
            }
            None => {}
        }
    }
}
