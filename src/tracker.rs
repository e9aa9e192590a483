//! Single-writer tracker handle with background compression and events.
//!
//! `RuckTracker` wraps the session state machine in a mutex and enforces the
//! concurrency contract: all mutation funnels through this handle, readers
//! get immutable snapshots, and observers receive events over mpsc channels
//! instead of sharing state.
//!
//! Live-buffer compression runs on a background thread so a long session
//! never stalls the fix pipeline: the worker clones the point buffer under a
//! brief lock, compresses it off-lock, and merges the result back only if
//! the buffer generation is unchanged. Stopping the session bumps the
//! generation, so an in-flight compression of a stale buffer is discarded
//! rather than merged into the next session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::compress::TrackCompressor;
use crate::error::Result;
use crate::sampling::PowerState;
use crate::session::{
    FinalizedSession, SessionSnapshot, SessionState, SessionStateMachine, TrackerConfig,
};
use crate::terrain::{TerrainClassification, TerrainType};
use crate::{LocationFix, MotionSample};

/// How often the background worker considers a live-buffer compression.
const BACKGROUND_COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Worker wake-up granularity; bounds how long stop() waits for the join.
const WORKER_TICK: Duration = Duration::from_millis(250);

/// Skip background compression below this buffer size.
const MIN_POINTS_FOR_BACKGROUND_COMPACT: usize = 1024;

/// Events published to subscribers.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    StateChanged(SessionState),
    TerrainChanged(TerrainClassification),
    SessionFinalized(FinalizedSession),
}

/// Thread-safe tracker handle owning the session state machine.
///
/// Create one per tracking context; it is not a global singleton. Cloning is
/// deliberately not offered: exactly one owner drives mutation, everyone
/// else consumes snapshots and events.
pub struct RuckTracker {
    inner: Arc<Mutex<SessionStateMachine>>,
    subscribers: Mutex<Vec<Sender<TrackerEvent>>>,
    /// Bumped on start/stop; the worker discards merges from a stale
    /// generation
    generation: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    compressor: TrackCompressor,
    worker: Option<JoinHandle<()>>,
}

impl RuckTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let compressor = TrackCompressor::new(config.compression.clone());
        Self {
            inner: Arc::new(Mutex::new(SessionStateMachine::new(config))),
            subscribers: Mutex::new(Vec::new()),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            compressor,
            worker: None,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a session and launch the background compression worker.
    pub fn start(&mut self, timestamp_ms: i64) -> Result<()> {
        self.lock_inner().start(timestamp_ms)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.spawn_worker();
        self.publish(TrackerEvent::StateChanged(SessionState::Tracking));
        Ok(())
    }

    pub fn pause(&mut self, timestamp_ms: i64) -> Result<()> {
        self.lock_inner().pause(timestamp_ms)?;
        self.publish(TrackerEvent::StateChanged(SessionState::Paused));
        Ok(())
    }

    pub fn resume(&mut self, timestamp_ms: i64) -> Result<()> {
        self.lock_inner().resume(timestamp_ms)?;
        self.publish(TrackerEvent::StateChanged(SessionState::Tracking));
        Ok(())
    }

    /// Stop the session: cancel in-flight background work, run the final
    /// compression synchronously, and return the finalized output.
    pub fn stop(&mut self, timestamp_ms: i64) -> Result<FinalizedSession> {
        let finalized = self.lock_inner().stop(timestamp_ms)?;
        // Invalidate any compression snapshot taken before the stop
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.join_worker();
        self.publish(TrackerEvent::StateChanged(SessionState::Stopped));
        self.publish(TrackerEvent::SessionFinalized(finalized.clone()));
        Ok(finalized)
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Process one positioning fix; publishes state and terrain change
    /// events triggered by it (auto-pause, auto-resume, new detection).
    pub fn process_fix(&self, fix: LocationFix) -> bool {
        let (appended, state_change, terrain_change) = {
            let mut inner = self.lock_inner();
            let state_before = inner.state();
            let terrain_before = inner.current_terrain().terrain;
            let appended = inner.process_fix(fix);
            let state_after = inner.state();
            let terrain_after = inner.current_terrain();
            (
                appended,
                (state_before != state_after).then_some(state_after),
                (terrain_before != terrain_after.terrain).then_some(terrain_after),
            )
        };
        if let Some(state) = state_change {
            self.publish(TrackerEvent::StateChanged(state));
        }
        if let Some(terrain) = terrain_change {
            self.publish(TrackerEvent::TerrainChanged(terrain));
        }
        appended
    }

    pub fn process_motion(&self, sample: MotionSample) {
        self.lock_inner().process_motion(sample);
    }

    pub fn process_pressure(&self, timestamp_ms: i64, pressure_hpa: f64) {
        self.lock_inner().process_pressure(timestamp_ms, pressure_hpa);
    }

    pub fn set_power_state(&self, power: PowerState) {
        self.lock_inner().set_power_state(power);
    }

    pub fn calibrate_elevation(&self, known_elevation: f64, reference_pressure: f64) -> Result<()> {
        self.lock_inner()
            .calibrate_elevation(known_elevation, reference_pressure)
    }

    pub fn set_terrain_override(&self, terrain: TerrainType, timestamp_ms: i64) {
        let classification = {
            let mut inner = self.lock_inner();
            inner.set_terrain_override(terrain, timestamp_ms);
            inner.current_terrain()
        };
        self.publish(TrackerEvent::TerrainChanged(classification));
    }

    pub fn clear_terrain_override(&self, timestamp_ms: i64) {
        self.lock_inner().clear_terrain_override(timestamp_ms);
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Immutable snapshot for UI readers; holds the lock only while copying.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock_inner().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state()
    }

    /// Diagnostic JSON dump for operational tooling.
    pub fn diagnostics(&self) -> String {
        self.lock_inner().diagnostics()
    }

    /// Subscribe to tracker events. Each subscriber gets its own channel;
    /// a dropped receiver is pruned on the next publish.
    pub fn subscribe(&self) -> Receiver<TrackerEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock_subscribers().push(tx);
        rx
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn publish(&self, event: TrackerEvent) {
        self.lock_subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// A poisoned mutex means a panic mid-update; the session data is still
    /// the best record we have, so recover the guard rather than poison the
    /// whole tracker.
    fn lock_inner(&self) -> MutexGuard<'_, SessionStateMachine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Sender<TrackerEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let generation = Arc::clone(&self.generation);
        let compressor = self.compressor.clone();

        self.worker = Some(thread::spawn(move || {
            let mut next_run = Instant::now() + BACKGROUND_COMPACT_INTERVAL;
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(WORKER_TICK);
                if Instant::now() < next_run {
                    continue;
                }
                next_run = Instant::now() + BACKGROUND_COMPACT_INTERVAL;
                background_compact(&inner, &generation, &compressor);
            }
            debug!("Background compression worker exited");
        }));
    }

    fn join_worker(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Background compression worker panicked");
            }
        }
    }
}

impl Drop for RuckTracker {
    fn drop(&mut self) {
        self.join_worker();
    }
}

/// One background compression cycle: snapshot under a brief lock, compress
/// off-lock, merge back only if the generation is unchanged.
fn background_compact(
    inner: &Mutex<SessionStateMachine>,
    generation: &AtomicU64,
    compressor: &TrackCompressor,
) {
    let (gen_at_snapshot, points, changes) = {
        let guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.state() == SessionState::Stopped
            || guard.points().len() < MIN_POINTS_FOR_BACKGROUND_COMPACT
        {
            return;
        }
        (
            generation.load(Ordering::Acquire),
            guard.points().to_vec(),
            guard.terrain_change_log().to_vec(),
        )
    };

    let prefix_len = points.len();
    let result = compressor.compress(&points, &changes);
    debug!(
        "Background compaction: {} -> {} points",
        prefix_len, result.compressed_count
    );

    let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if generation.load(Ordering::Acquire) == gen_at_snapshot
        && guard.state() != SessionState::Stopped
    {
        guard.merge_compacted_prefix(prefix_len, result.points);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RuckTracker {
        RuckTracker::new(TrackerConfig::default())
    }

    fn walking_fix(i: i64) -> LocationFix {
        LocationFix::new(i * 1000, 51.5 + i as f64 * 0.0001, -0.12)
            .with_speed(1.3)
            .with_altitude(100.0, 3.0)
    }

    #[test]
    fn test_lifecycle_emits_state_events() {
        let mut t = tracker();
        let rx = t.subscribe();

        t.start(0).unwrap();
        t.pause(1000).unwrap();
        t.resume(2000).unwrap();
        t.stop(3000).unwrap();

        let states: Vec<SessionState> = rx
            .try_iter()
            .filter_map(|e| match e {
                TrackerEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Tracking,
                SessionState::Paused,
                SessionState::Tracking,
                SessionState::Stopped,
            ]
        );
    }

    #[test]
    fn test_stop_emits_finalized_session() {
        let mut t = tracker();
        let rx = t.subscribe();
        t.start(0).unwrap();
        for i in 1..=20 {
            t.process_fix(walking_fix(i));
        }
        let returned = t.stop(21_000).unwrap();

        let finalized = rx
            .try_iter()
            .find_map(|e| match e {
                TrackerEvent::SessionFinalized(f) => Some(f),
                _ => None,
            })
            .expect("no SessionFinalized event");
        assert_eq!(finalized.points.len(), returned.points.len());
        assert!(!finalized.points.is_empty());
    }

    #[test]
    fn test_invalid_lifecycle_propagates_error() {
        let mut t = tracker();
        assert!(t.pause(0).is_err());
        assert!(t.stop(0).is_err());
        t.start(0).unwrap();
        assert!(t.start(1).is_err());
        t.stop(2).unwrap();
    }

    #[test]
    fn test_snapshot_tracks_distance() {
        let mut t = tracker();
        t.start(0).unwrap();
        for i in 1..=20 {
            t.process_fix(walking_fix(i));
        }
        let snap = t.snapshot();
        assert!(snap.total_distance > 150.0, "got {}", snap.total_distance);
        assert_eq!(snap.state, SessionState::Tracking);
        t.stop(21_000).unwrap();
    }

    #[test]
    fn test_terrain_override_emits_event() {
        let mut t = tracker();
        t.start(0).unwrap();
        let rx = t.subscribe();
        t.set_terrain_override(TerrainType::Mud, 1000);

        let terrain = rx
            .try_iter()
            .find_map(|e| match e {
                TrackerEvent::TerrainChanged(c) => Some(c),
                _ => None,
            })
            .expect("no TerrainChanged event");
        assert_eq!(terrain.terrain, TerrainType::Mud);
        assert!(terrain.is_manual_override);
        t.stop(2000).unwrap();
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let mut t = tracker();
        {
            let _rx = t.subscribe();
        } // receiver dropped immediately
        let rx_alive = t.subscribe();

        t.start(0).unwrap();
        assert!(matches!(
            rx_alive.try_recv(),
            Ok(TrackerEvent::StateChanged(SessionState::Tracking))
        ));
        t.stop(1000).unwrap();
    }

    #[test]
    fn test_worker_joins_on_stop() {
        let mut t = tracker();
        t.start(0).unwrap();
        for i in 1..=5 {
            t.process_fix(walking_fix(i));
        }
        t.stop(6000).unwrap();
        assert!(t.worker.is_none());
    }

    #[test]
    fn test_restart_after_stop() {
        let mut t = tracker();
        t.start(0).unwrap();
        t.process_fix(walking_fix(1));
        t.stop(2000).unwrap();

        t.start(10_000).unwrap();
        for i in 11..=15 {
            t.process_fix(walking_fix(i));
        }
        let snap = t.snapshot();
        // Fresh session: only the new fixes count
        assert!(snap.total_distance < 60.0, "got {}", snap.total_distance);
        t.stop(16_000).unwrap();
    }
}
