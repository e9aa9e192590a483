//! Scalar Kalman filter fusing barometric and GPS altitude.
//!
//! The engine keeps a single altitude state `x` with variance `P`. Each
//! update cycle predicts forward with configured process noise, then applies
//! sequential Kalman updates for whichever observations are available:
//! barometric-derived altitude with fixed measurement noise, and GPS
//! altitude with noise scaled by the reported vertical accuracy (a 2 m fix
//! pulls the estimate far harder than a 50 m fix).
//!
//! A stability factor in [0, 1] is derived from the variance of recent
//! residuals: steady pressure and altitude give values near 1, rapid swings
//! drive it toward 0. Callers use it to decide how much to trust the
//! current estimate.
//!
//! Inputs are clamped to a sane physical range before fusion so a single
//! glitched sample cannot step the estimate off a cliff; the Kalman gain
//! bounds whatever remains.

use std::collections::VecDeque;

use log::debug;
use serde::{Deserialize, Serialize};

/// Standard sea-level pressure in hPa.
const STANDARD_PRESSURE_HPA: f64 = 1013.25;

/// The current fused elevation estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElevationEstimate {
    /// Filtered altitude in meters
    pub altitude: f64,
    /// Standard deviation of the estimate in meters, always > 0
    pub uncertainty: f64,
    /// Stability factor in [0, 1] from recent residual variance
    pub stability: f64,
}

/// Configuration for the elevation fusion engine.
#[derive(Debug, Clone)]
pub struct ElevationConfig {
    /// Process noise added to the variance per second (m²/s). Default: 0.05
    pub process_noise: f64,

    /// Measurement noise variance for barometric altitude (m²). Default: 0.5
    pub baro_noise: f64,

    /// Floor applied to reported GPS vertical accuracy before squaring
    /// into measurement noise (m). Default: 1.0
    pub gps_accuracy_floor: f64,

    /// Physical altitude clamp range in meters. Default: -500..9000
    pub min_altitude: f64,
    pub max_altitude: f64,

    /// Number of recent residuals used for the stability factor. Default: 10
    pub stability_window: usize,

    /// Residual variance (m²) at which stability has fallen to 0.5.
    /// Default: 4.0
    pub stability_scale: f64,

    /// Initial estimate variance before the first measurement (m²).
    /// Default: 2500 (50 m standard deviation)
    pub initial_variance: f64,

    /// Variance after calibration against a trusted reference (m²).
    /// Default: 0.25
    pub calibrated_variance: f64,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.05,
            baro_noise: 0.5,
            gps_accuracy_floor: 1.0,
            min_altitude: -500.0,
            max_altitude: 9000.0,
            stability_window: 10,
            stability_scale: 4.0,
            initial_variance: 2500.0,
            calibrated_variance: 0.25,
        }
    }
}

/// Scalar Kalman filter for elevation.
#[derive(Debug)]
pub struct ElevationFusionEngine {
    config: ElevationConfig,
    /// Altitude state in meters; None until the first measurement
    x: Option<f64>,
    /// Estimate variance in m²
    p: f64,
    last_update_ms: Option<i64>,
    /// Sea-level reference pressure for pressure-to-altitude conversion
    reference_pressure: f64,
    recent_residuals: VecDeque<f64>,
}

impl ElevationFusionEngine {
    pub fn new(config: ElevationConfig) -> Self {
        let p = config.initial_variance;
        Self {
            config,
            x: None,
            p,
            last_update_ms: None,
            reference_pressure: STANDARD_PRESSURE_HPA,
            recent_residuals: VecDeque::new(),
        }
    }

    /// Reset the estimate to a trusted elevation and collapse the variance.
    ///
    /// Used at session start or whenever a known reference (surveyed
    /// trailhead, calibrated watch) is available. The reference pressure is
    /// retained for subsequent pressure-to-altitude conversion.
    pub fn calibrate(&mut self, known_elevation: f64, reference_pressure: f64) {
        self.x = Some(known_elevation);
        self.p = self.config.calibrated_variance;
        if reference_pressure.is_finite() && reference_pressure > 0.0 {
            self.reference_pressure = reference_pressure;
        }
        self.recent_residuals.clear();
        debug!(
            "Elevation calibrated to {:.1}m (ref pressure {:.2} hPa)",
            known_elevation, self.reference_pressure
        );
    }

    /// Fuse whichever observations are available at this timestamp.
    ///
    /// `baro_altitude` is a barometric-derived absolute altitude in meters;
    /// `gps` is `(altitude, vertical_accuracy)`. Returns the updated
    /// estimate. With no usable observation, the prediction step still runs
    /// and the prior estimate is returned with grown uncertainty.
    pub fn update(
        &mut self,
        timestamp_ms: i64,
        baro_altitude: Option<f64>,
        gps: Option<(f64, f64)>,
    ) -> ElevationEstimate {
        // Predict: no deterministic drift model, variance grows with time
        if let Some(last) = self.last_update_ms {
            let dt_s = ((timestamp_ms - last).max(0)) as f64 / 1000.0;
            self.p += self.config.process_noise * dt_s;
        }
        self.last_update_ms = Some(timestamp_ms);

        if let Some(z) = baro_altitude.and_then(|z| self.sanitize(z)) {
            self.fuse(z, self.config.baro_noise);
        }
        if let Some((alt, accuracy)) = gps {
            if let Some(z) = self.sanitize(alt) {
                let sigma = accuracy.max(self.config.gps_accuracy_floor);
                self.fuse(z, sigma * sigma);
            }
        }

        self.estimate()
    }

    /// Convenience entry point for a raw pressure sample in hPa.
    ///
    /// Converts via the barometric formula against the calibrated reference
    /// pressure, then fuses it as a barometric observation.
    pub fn update_pressure(&mut self, timestamp_ms: i64, pressure_hpa: f64) -> ElevationEstimate {
        let baro = if pressure_hpa.is_finite() && pressure_hpa > 0.0 {
            Some(altitude_from_pressure(pressure_hpa, self.reference_pressure))
        } else {
            None
        };
        self.update(timestamp_ms, baro, None)
    }

    /// The current estimate without fusing anything.
    pub fn estimate(&self) -> ElevationEstimate {
        ElevationEstimate {
            altitude: self.x.unwrap_or(0.0),
            // Uncertainty is a standard deviation and must stay positive
            uncertainty: self.p.max(1e-6).sqrt(),
            stability: self.stability(),
        }
    }

    /// Whether the filter has seen at least one measurement.
    pub fn is_initialized(&self) -> bool {
        self.x.is_some()
    }

    /// One sequential Kalman update with measurement noise variance `r`.
    fn fuse(&mut self, z: f64, r: f64) {
        let x = match self.x {
            Some(x) => x,
            None => {
                // First measurement seeds the state directly
                self.x = Some(z);
                self.p = r.min(self.config.initial_variance);
                return;
            }
        };

        let residual = z - x;
        self.push_residual(residual);

        let k = self.p / (self.p + r);
        self.x = Some(x + k * residual);
        self.p *= 1.0 - k;
    }

    /// Clamp an observation into the physical range; reject non-finite.
    fn sanitize(&self, z: f64) -> Option<f64> {
        if !z.is_finite() {
            return None;
        }
        Some(z.clamp(self.config.min_altitude, self.config.max_altitude))
    }

    fn push_residual(&mut self, residual: f64) {
        self.recent_residuals.push_back(residual);
        while self.recent_residuals.len() > self.config.stability_window {
            self.recent_residuals.pop_front();
        }
    }

    /// Stability from residual variance: 1 for a quiet filter, toward 0
    /// under rapid pressure or altitude swings.
    fn stability(&self) -> f64 {
        if self.recent_residuals.len() < 2 {
            return 1.0;
        }
        let n = self.recent_residuals.len() as f64;
        let mean = self.recent_residuals.iter().sum::<f64>() / n;
        let var = self
            .recent_residuals
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / n;
        1.0 / (1.0 + var / self.config.stability_scale)
    }
}

/// International barometric formula, altitude in meters from pressure in hPa.
pub fn altitude_from_pressure(pressure_hpa: f64, reference_hpa: f64) -> f64 {
    44_330.0 * (1.0 - (pressure_hpa / reference_hpa).powf(1.0 / 5.255))
}
