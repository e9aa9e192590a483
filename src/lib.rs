//! # Ruck Core
//!
//! Real-time sensor fusion and track processing for outdoor weighted-walking
//! ("ruck") activities.
//!
//! This library turns a continuous stream of noisy positioning and motion
//! samples into a stable, storable trail:
//! - Filtered elevation via a scalar Kalman filter (barometer + GPS)
//! - Terrain classification from motion signatures, with manual override
//! - Running distance, pace, grade, and elevation gain/loss
//! - Douglas-Peucker track compression with key-point preservation
//! - A session state machine with auto-pause semantics
//! - Adaptive GPS sampling driven by movement pattern and battery state
//!
//! Presentation, persistence, health-platform registration, and export file
//! formats are external collaborators: this core hands them immutable
//! snapshots and a finalized compressed point sequence.
//!
//! ## Quick Start
//!
//! ```rust
//! use ruck_core::{LocationFix, SessionStateMachine, TrackerConfig};
//!
//! let mut session = SessionStateMachine::new(TrackerConfig::default());
//! session.start(0).unwrap();
//!
//! // Feed fixes from the positioning collaborator
//! for i in 1..10 {
//!     let fix = LocationFix::new(i * 1000, 51.5074 + i as f64 * 0.0001, -0.1278)
//!         .with_speed(1.3);
//!     session.process_fix(fix);
//! }
//!
//! let snapshot = session.snapshot();
//! assert!(snapshot.total_distance > 0.0);
//!
//! let finalized = session.stop(10_000).unwrap();
//! assert!(!finalized.points.is_empty());
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, TrackError};

// Geographic utilities (distance, polyline length, perpendicular deviation)
pub mod geo_utils;

// Adaptive positioning accuracy and update frequency control
pub mod sampling;
pub use sampling::{
    AccuracyTier, AdaptiveSamplingController, MovementPattern, PowerState, SamplingConfig,
    SamplingDecision,
};

// Scalar Kalman filter fusing barometric and GPS altitude
pub mod elevation;
pub use elevation::{ElevationConfig, ElevationEstimate, ElevationFusionEngine};

// Terrain classification from motion signatures
pub mod terrain;
pub use terrain::{
    DetectionMethod, TerrainChange, TerrainClassification, TerrainClassifier, TerrainConfig,
    TerrainType,
};

// Running distance / pace / grade / elevation accumulation
pub mod metrics;
pub use metrics::{MetricsAccumulator, MetricsConfig};

// Douglas-Peucker track compression with key-point preservation
pub mod compress;
pub use compress::{CompressionConfig, CompressionResult, TrackCompressor};

// Session state machine and per-fix processing pipeline
pub mod session;
pub use session::{
    FinalizedSession, SessionConfig, SessionSnapshot, SessionState, SessionStateMachine,
    TrackerConfig,
};

// Single-writer shared handle with background compression and events
pub mod tracker;
pub use tracker::{RuckTracker, TrackerEvent};

// ============================================================================
// Core Types
// ============================================================================

/// One timestamped positioning sample from the device positioning service.
///
/// Immutable value produced by the positioning collaborator; consumed once,
/// never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Milliseconds since session epoch (or Unix epoch; only deltas matter)
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Raw GPS altitude in meters
    pub altitude: f64,
    /// Horizontal accuracy radius in meters (larger = worse)
    pub horizontal_accuracy: f64,
    /// Vertical accuracy in meters (larger = worse)
    pub vertical_accuracy: f64,
    /// Ground speed in m/s
    pub speed: f64,
    /// Course over ground in degrees from true north
    pub course: f64,
}

impl LocationFix {
    /// Create a fix with neutral defaults for altitude, accuracy, and speed.
    pub fn new(timestamp_ms: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp_ms,
            latitude,
            longitude,
            altitude: 0.0,
            horizontal_accuracy: 5.0,
            vertical_accuracy: 5.0,
            speed: 0.0,
            course: 0.0,
        }
    }

    pub fn with_altitude(mut self, altitude: f64, vertical_accuracy: f64) -> Self {
        self.altitude = altitude;
        self.vertical_accuracy = vertical_accuracy;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_horizontal_accuracy(mut self, accuracy: f64) -> Self {
        self.horizontal_accuracy = accuracy;
        self
    }

    /// Check that the fix is physically plausible.
    ///
    /// Out-of-range coordinates, non-finite values, and negative accuracy
    /// radii are all grounds for rejection before fusion.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
            && self.altitude.is_finite()
            && self.horizontal_accuracy.is_finite()
            && self.horizontal_accuracy >= 0.0
            && self.vertical_accuracy.is_finite()
            && self.vertical_accuracy >= 0.0
            && self.speed.is_finite()
    }
}

/// One sample from the device motion service.
///
/// Consumed by the terrain classifier inside a bounded sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub timestamp_ms: i64,
    /// User acceleration in g, device axes [x, y, z]
    pub acceleration: [f64; 3],
    /// Rotation rate in rad/s, device axes [x, y, z]
    pub rotation_rate: [f64; 3],
}

impl MotionSample {
    pub fn new(timestamp_ms: i64, acceleration: [f64; 3], rotation_rate: [f64; 3]) -> Self {
        Self {
            timestamp_ms,
            acceleration,
            rotation_rate,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.acceleration.iter().all(|v| v.is_finite())
            && self.rotation_rate.iter().all(|v| v.is_finite())
    }
}

/// A fix enriched with fused elevation, terrain, and instantaneous grade.
///
/// Appended to the session's point buffer once per accepted fix; the buffer
/// is the sole input to the track compressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedPoint {
    pub fix: LocationFix,
    pub elevation: ElevationEstimate,
    pub terrain: TerrainClassification,
    /// Instantaneous grade (rise over run) at this point
    pub grade: f64,
}
