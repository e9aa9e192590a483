//! Douglas-Peucker track compression with key-point preservation.
//!
//! The geometric pass is a standard Douglas-Peucker simplification over the
//! enriched point buffer, run iteratively with an explicit segment stack so
//! long, nearly-straight routes cannot blow the call stack. Epsilon is a
//! perpendicular deviation tolerance in meters.
//!
//! Layered on top are preservation rules the geometric pass must not
//! override: the first and last point of the buffer are always kept, as are
//! points marking a terrain-type change and points whose fused elevation
//! has moved more than a threshold since the last kept point. This keeps
//! downstream elevation-profile and terrain-segment reconstruction accurate
//! after compression.

use log::debug;
use serde::Serialize;

use crate::geo_utils::perpendicular_distance;
use crate::terrain::TerrainChange;
use crate::EnrichedPoint;

/// Configuration for track compression.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Maximum tolerated perpendicular deviation in meters. Default: 7.5
    pub epsilon_m: f64,

    /// Keep any point whose fused elevation differs from the last kept
    /// point by more than this many meters. Default: 5.0
    pub elevation_threshold_m: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            epsilon_m: 7.5,
            elevation_threshold_m: 5.0,
        }
    }
}

/// Result of a compression run.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub points: Vec<EnrichedPoint>,
    pub original_count: usize,
    pub compressed_count: usize,
}

impl CompressionResult {
    /// Compressed/original point ratio; 1.0 for an empty input.
    pub fn ratio(&self) -> f64 {
        if self.original_count == 0 {
            return 1.0;
        }
        self.compressed_count as f64 / self.original_count as f64
    }
}

/// Douglas-Peucker polyline simplifier with key-point preservation.
#[derive(Debug, Clone)]
pub struct TrackCompressor {
    config: CompressionConfig,
}

impl TrackCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress an ordered point buffer.
    ///
    /// `terrain_changes` supplies the change log whose segment boundaries
    /// must survive compression. Points are assumed ordered by timestamp.
    pub fn compress(
        &self,
        points: &[EnrichedPoint],
        terrain_changes: &[TerrainChange],
    ) -> CompressionResult {
        let n = points.len();
        if n <= 2 {
            return CompressionResult {
                points: points.to_vec(),
                original_count: n,
                compressed_count: n,
            };
        }

        let mut keep = vec![false; n];
        keep[0] = true;
        keep[n - 1] = true;

        self.mark_geometric(points, &mut keep);
        mark_terrain_changes(points, terrain_changes, &mut keep);
        self.mark_elevation_steps(points, &mut keep);

        let compressed: Vec<EnrichedPoint> = points
            .iter()
            .zip(keep.iter())
            .filter(|(_, &k)| k)
            .map(|(p, _)| p.clone())
            .collect();

        let result = CompressionResult {
            compressed_count: compressed.len(),
            original_count: n,
            points: compressed,
        };
        debug!(
            "Compressed {} -> {} points (ratio {:.2})",
            result.original_count,
            result.compressed_count,
            result.ratio()
        );
        result
    }

    /// Iterative Douglas-Peucker over an explicit segment stack.
    fn mark_geometric(&self, points: &[EnrichedPoint], keep: &mut [bool]) {
        let mut stack: Vec<(usize, usize)> = vec![(0, points.len() - 1)];

        while let Some((start, end)) = stack.pop() {
            if end <= start + 1 {
                continue;
            }
            let a = &points[start].fix;
            let b = &points[end].fix;

            let mut max_dist = 0.0;
            let mut max_idx = start;
            for (i, p) in points.iter().enumerate().take(end).skip(start + 1) {
                let d = perpendicular_distance(
                    p.fix.latitude,
                    p.fix.longitude,
                    a.latitude,
                    a.longitude,
                    b.latitude,
                    b.longitude,
                );
                if d > max_dist {
                    max_dist = d;
                    max_idx = i;
                }
            }

            if max_dist > self.config.epsilon_m {
                keep[max_idx] = true;
                stack.push((start, max_idx));
                stack.push((max_idx, end));
            }
        }
    }

    /// Keep any point whose elevation has stepped more than the threshold
    /// since the last kept point, walking the buffer in order.
    fn mark_elevation_steps(&self, points: &[EnrichedPoint], keep: &mut [bool]) {
        let mut last_kept_elevation = points[0].elevation.altitude;
        for (i, p) in points.iter().enumerate().skip(1) {
            if keep[i] {
                last_kept_elevation = p.elevation.altitude;
                continue;
            }
            if (p.elevation.altitude - last_kept_elevation).abs()
                > self.config.elevation_threshold_m
            {
                keep[i] = true;
                last_kept_elevation = p.elevation.altitude;
            }
        }
    }
}

/// Keep the first point at or after each terrain segment boundary.
fn mark_terrain_changes(points: &[EnrichedPoint], changes: &[TerrainChange], keep: &mut [bool]) {
    for change in changes {
        let idx = points.partition_point(|p| p.fix.timestamp_ms < change.start_ms);
        if idx < points.len() {
            keep[idx] = true;
        }
    }
}
