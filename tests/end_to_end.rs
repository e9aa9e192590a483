//! End-to-end pipeline tests driving the public API the way a device
//! integration would: interleaved positioning fixes and motion samples,
//! lifecycle calls, and a finalized compressed track at the end.

use std::time::{Duration, Instant};

use ruck_core::geo_utils::polyline_length;
use ruck_core::{
    CompressionConfig, DetectionMethod, ElevationEstimate, EnrichedPoint, LocationFix,
    MotionSample, RuckTracker, SessionState, SessionStateMachine, TerrainClassification,
    TerrainType, TrackCompressor, TrackerConfig, TrackerEvent,
};

const METERS_PER_DEGREE_LAT: f64 = 111_195.0;

/// A fix on a northward walk at 1.3 m/s with one fix per second and a
/// gentle +2m per 100m elevation ramp.
fn ramp_fix(i: i64) -> LocationFix {
    let step_m = 1.3;
    LocationFix::new(
        i * 1000,
        47.36 + i as f64 * step_m / METERS_PER_DEGREE_LAT,
        8.54,
    )
    .with_speed(1.3)
    .with_altitude(520.0 + i as f64 * step_m * 0.02, 3.0)
}

/// Synthetic trail-footfall motion: a 1.6 Hz vertical sine with matching
/// rotation noise, sampled at 50 Hz.
fn trail_motion(start_ms: i64, samples: usize) -> Vec<MotionSample> {
    let accel_amp = (2.0_f64 * 0.09).sqrt();
    let rot_amp = (2.0_f64 * 0.30).sqrt();
    (0..samples)
        .map(|i| {
            let t = i as f64 * 0.02;
            let phase = 2.0 * std::f64::consts::PI * 1.6 * t;
            MotionSample::new(
                start_ms + i as i64 * 20,
                [0.0, 0.0, accel_amp * phase.sin()],
                [0.0, 0.0, rot_amp * phase.sin()],
            )
        })
        .collect()
}

#[test]
fn walking_ramp_scenario() {
    let mut session = SessionStateMachine::new(TrackerConfig::default());
    session.start(0).unwrap();

    for i in 0..60 {
        // One second of footfall signal leading up to each fix
        for sample in trail_motion(i * 1000 - 1000, 50) {
            session.process_motion(sample);
        }
        session.process_fix(ramp_fix(i));
    }

    let snapshot = session.snapshot();

    // 59 segments of 1.3m, roughly 78m
    assert!(
        snapshot.total_distance > 74.0 && snapshot.total_distance < 82.0,
        "distance {}",
        snapshot.total_distance
    );

    // Monotonic gentle ramp: ~1.5m total rise registers as gain, no loss
    assert!(
        snapshot.elevation_gain > 0.5 && snapshot.elevation_gain < 1.6,
        "gain {}",
        snapshot.elevation_gain
    );
    assert_eq!(snapshot.elevation_loss, 0.0);

    // 2% uphill grade
    assert!(
        (snapshot.current_grade - 0.02).abs() < 0.01,
        "grade {}",
        snapshot.current_grade
    );

    // Footfall signal classifies as trail with real separation
    assert_eq!(snapshot.current_terrain, TerrainType::Trail);
    assert!(
        snapshot.terrain_confidence > 0.5,
        "confidence {}",
        snapshot.terrain_confidence
    );
    assert_eq!(snapshot.current_terrain_factor, 1.3);

    let finalized = session.stop(60_000).unwrap();
    assert!(finalized.points.len() < 60);
    assert_eq!(finalized.original_point_count, 60);
    assert_eq!(finalized.points.first().unwrap().fix, ramp_fix(0));
    assert_eq!(finalized.points.last().unwrap().fix, ramp_fix(59));
    assert!(finalized
        .terrain_changes
        .iter()
        .any(|c| c.terrain == TerrainType::Trail));
}

#[test]
fn auto_pause_round_trip_via_tracker() {
    let mut tracker = RuckTracker::new(TrackerConfig::default());
    let events = tracker.subscribe();
    tracker.start(0).unwrap();

    // Walk for 10 fixes, then stand still past the 40s idle threshold
    for i in 0..10 {
        tracker.process_fix(ramp_fix(i));
    }
    let still = ramp_fix(9);
    for i in 1..=12 {
        let fix = LocationFix::new(9_000 + i * 5000, still.latitude, still.longitude)
            .with_speed(0.0)
            .with_altitude(still.altitude, 3.0);
        tracker.process_fix(fix);
    }
    assert_eq!(tracker.state(), SessionState::AutoPaused);

    // Real displacement resumes tracking without a lifecycle call
    let moving = LocationFix::new(75_000, still.latitude + 0.0002, still.longitude)
        .with_speed(1.3)
        .with_altitude(still.altitude, 3.0);
    tracker.process_fix(moving);
    assert_eq!(tracker.state(), SessionState::Tracking);

    let states: Vec<SessionState> = events
        .try_iter()
        .filter_map(|e| match e {
            TrackerEvent::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert!(states.contains(&SessionState::AutoPaused));
    assert_eq!(states.last(), Some(&SessionState::Tracking));

    // Tracked duration excludes the auto-paused stretch
    let snapshot = tracker.snapshot();
    assert!(
        snapshot.elapsed_tracked_ms < 60_000,
        "tracked {}ms should exclude the idle window",
        snapshot.elapsed_tracked_ms
    );
    tracker.stop(80_000).unwrap();
}

#[test]
fn manual_pause_survives_movement() {
    let mut tracker = RuckTracker::new(TrackerConfig::default());
    tracker.start(0).unwrap();
    for i in 0..5 {
        tracker.process_fix(ramp_fix(i));
    }
    let distance_at_pause = tracker.snapshot().total_distance;
    tracker.pause(25_000).unwrap();

    // Large movement while manually paused must not resume or accumulate
    for i in 6..20 {
        tracker.process_fix(ramp_fix(i));
    }
    assert_eq!(tracker.state(), SessionState::Paused);
    assert_eq!(tracker.snapshot().total_distance, distance_at_pause);

    tracker.resume(100_000).unwrap();
    assert_eq!(tracker.state(), SessionState::Tracking);
    tracker.stop(110_000).unwrap();
}

#[test]
fn compression_of_large_track_is_fast() {
    // A 10k-point wandering track with a slow elevation profile
    let n = 10_000;
    let points: Vec<EnrichedPoint> = (0..n)
        .map(|i| {
            let wander = 50.0 * (i as f64 / 500.0 * std::f64::consts::PI).sin();
            let fix = LocationFix::new(
                i as i64 * 1000,
                47.36 + i as f64 * 1.3 / METERS_PER_DEGREE_LAT,
                8.54 + wander / 75_000.0,
            );
            EnrichedPoint {
                fix,
                elevation: ElevationEstimate {
                    altitude: 520.0 + 30.0 * (i as f64 / 2000.0 * std::f64::consts::PI).sin(),
                    uncertainty: 1.5,
                    stability: 0.9,
                },
                terrain: TerrainClassification {
                    terrain: TerrainType::Gravel,
                    confidence: 0.7,
                    method: DetectionMethod::Fusion,
                    is_manual_override: false,
                    timestamp_ms: i as i64 * 1000,
                },
                grade: 0.0,
            }
        })
        .collect();

    let compressor = TrackCompressor::new(CompressionConfig::default());
    let started = Instant::now();
    let result = compressor.compress(&points, &[]);
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(1),
        "compression took {:?}",
        elapsed
    );
    assert!(result.compressed_count < result.original_count);
    assert_eq!(result.points.first().unwrap().fix, points[0].fix);
    assert_eq!(result.points.last().unwrap().fix, points[n - 1].fix);

    // Compression may cut corners only within epsilon; track length survives
    let original_fixes: Vec<LocationFix> = points.iter().map(|p| p.fix).collect();
    let compressed_fixes: Vec<LocationFix> = result.points.iter().map(|p| p.fix).collect();
    let original_len = polyline_length(&original_fixes);
    let compressed_len = polyline_length(&compressed_fixes);
    assert!(
        (original_len - compressed_len).abs() / original_len < 0.05,
        "length {} -> {}",
        original_len,
        compressed_len
    );
}
