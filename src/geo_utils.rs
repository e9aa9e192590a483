//! Geographic utilities: distances, polyline length, perpendicular deviation.
//!
//! All distances are in meters. Great-circle distances use the haversine
//! formula from the `geo` crate; perpendicular deviation uses a local-plane
//! projection, which is accurate to well under a percent at track scale.

use geo::{Distance, Haversine, Point};

use crate::LocationFix;

/// Meters per degree of latitude (spherical earth).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance between two coordinates in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Haversine::distance(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

/// Horizontal distance between two fixes in meters.
pub fn fix_distance(a: &LocationFix, b: &LocationFix) -> f64 {
    haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Total horizontal length of a fix sequence in meters.
pub fn polyline_length(fixes: &[LocationFix]) -> f64 {
    fixes.windows(2).map(|w| fix_distance(&w[0], &w[1])).sum()
}

/// Perpendicular distance in meters from `p` to the chord `a`–`b`.
///
/// Projects all three coordinates onto a local plane centered at `a`
/// before computing the point-to-segment distance. Falls back to the
/// point-to-point distance when the chord is degenerate.
pub fn perpendicular_distance(
    p_lat: f64,
    p_lon: f64,
    a_lat: f64,
    a_lon: f64,
    b_lat: f64,
    b_lon: f64,
) -> f64 {
    let cos_lat = a_lat.to_radians().cos();

    let px = (p_lon - a_lon) * cos_lat * METERS_PER_DEGREE;
    let py = (p_lat - a_lat) * METERS_PER_DEGREE;
    let bx = (b_lon - a_lon) * cos_lat * METERS_PER_DEGREE;
    let by = (b_lat - a_lat) * METERS_PER_DEGREE;

    let chord_sq = bx * bx + by * by;
    if chord_sq == 0.0 {
        return (px * px + py * py).sqrt();
    }

    // Clamp the projection onto the segment, not the infinite line
    let t = ((px * bx + py * by) / chord_sq).clamp(0.0, 1.0);
    let dx = px - t * bx;
    let dy = py - t * by;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // London to Paris is roughly 344 km
        let d = haversine_distance(51.5074, -0.1278, 48.8566, 2.3522);
        assert!(d > 330_000.0 && d < 360_000.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        let d = haversine_distance(51.5, -0.12, 51.5, -0.12);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_polyline_length() {
        let fixes: Vec<LocationFix> = (0..5)
            .map(|i| LocationFix::new(i as i64 * 1000, 51.5 + i as f64 * 0.001, -0.12))
            .collect();
        let len = polyline_length(&fixes);
        // 4 segments of ~111m each
        assert!(len > 400.0 && len < 500.0, "got {}", len);
    }

    #[test]
    fn test_perpendicular_distance_on_chord() {
        // Midpoint of the chord itself deviates by zero
        let d = perpendicular_distance(51.5005, -0.12, 51.5, -0.12, 51.501, -0.12);
        assert!(d < 0.01, "got {}", d);
    }

    #[test]
    fn test_perpendicular_distance_offset() {
        // Point displaced east of a north-south chord by ~0.0001 deg (~7m at 51.5N)
        let d = perpendicular_distance(51.5005, -0.1199, 51.5, -0.12, 51.501, -0.12);
        assert!(d > 5.0 && d < 9.0, "got {}", d);
    }

    #[test]
    fn test_perpendicular_distance_degenerate_chord() {
        let d = perpendicular_distance(51.501, -0.12, 51.5, -0.12, 51.5, -0.12);
        assert!(d > 100.0 && d < 120.0, "got {}", d);
    }
}
