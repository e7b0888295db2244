//! Geodesic containment and boundary-distance tests for geofence shapes.
//!
//! Distances are great-circle (haversine) meters. Polygon containment is an
//! even-odd ray cast in lat/lng space, which is accurate for the small zones
//! drawn around a home or a park.

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

/// Coordinate equality threshold used when comparing zone geometry.
pub const COORD_TOLERANCE_DEG: f64 = 1e-6;

/// Radius equality threshold used when comparing circle zones.
pub const RADIUS_TOLERANCE_M: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside the WGS84 lat/lng ranges
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Component-wise match within `COORD_TOLERANCE_DEG`
    pub fn approx_eq(&self, other: &LatLng) -> bool {
        (self.lat - other.lat).abs() <= COORD_TOLERANCE_DEG
            && (self.lng - other.lng).abs() <= COORD_TOLERANCE_DEG
    }

    fn to_point(self) -> Point<f64> {
        // geo points are (x, y) = (lng, lat)
        Point::new(self.lng, self.lat)
    }
}

/// Great-circle distance in meters.
pub fn geodesic_distance(a: LatLng, b: LatLng) -> f64 {
    Haversine::distance(a.to_point(), b.to_point())
}

pub fn point_in_circle(point: LatLng, center: LatLng, radius_m: f64) -> bool {
    geodesic_distance(point, center) <= radius_m
}

/// Positive when `point` lies outside the circle.
pub fn distance_to_circle_boundary(point: LatLng, center: LatLng, radius_m: f64) -> f64 {
    geodesic_distance(point, center) - radius_m
}

/// Returns the ring with its first vertex repeated at the end if it was open.
pub fn closed_ring(vertices: &[LatLng]) -> Vec<LatLng> {
    let mut ring = vertices.to_vec();
    if let (Some(first), Some(last)) = (vertices.first(), vertices.last()) {
        if first != last {
            ring.push(*first);
        }
    }
    ring
}

pub fn point_in_polygon(point: LatLng, vertices: &[LatLng]) -> bool {
    debug_assert!(vertices.len() >= 3, "polygon needs at least 3 vertices");
    if vertices.len() < 3 {
        return false;
    }

    let ring = closed_ring(vertices);
    let mut inside = false;

    for edge in ring.windows(2) {
        let (a, b) = (edge[0], edge[1]);

        // Half-open on lat so a ray through a shared vertex counts once
        if (a.lat > point.lat) == (b.lat > point.lat) {
            continue;
        }

        let t = (point.lat - a.lat) / (b.lat - a.lat);
        let lng_crossing = a.lng + t * (b.lng - a.lng);
        if point.lng < lng_crossing {
            inside = !inside;
        }
    }

    inside
}

/// Minimum distance in meters from `point` to any edge of the polygon.
pub fn distance_to_polygon_boundary(point: LatLng, vertices: &[LatLng]) -> f64 {
    debug_assert!(vertices.len() >= 3, "polygon needs at least 3 vertices");

    closed_ring(vertices)
        .windows(2)
        .map(|edge| geodesic_distance(point, closest_point_on_segment(point, edge[0], edge[1])))
        .fold(f64::INFINITY, f64::min)
}

/// Closest point on segment `a`-`b` to `p`, solved in a local equirectangular
/// plane centered on `p` (longitudes scaled by cos(lat)).
fn closest_point_on_segment(p: LatLng, a: LatLng, b: LatLng) -> LatLng {
    let k = p.lat.to_radians().cos();
    let (ax, ay) = ((a.lng - p.lng) * k, a.lat - p.lat);
    let (bx, by) = ((b.lng - p.lng) * k, b.lat - p.lat);
    let (dx, dy) = (bx - ax, by - ay);

    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return a;
    }

    let t = (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0);
    LatLng::new(a.lat + t * (b.lat - a.lat), a.lng + t * (b.lng - a.lng))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<LatLng> {
        vec![
            LatLng::new(0.0, 0.0),
            LatLng::new(0.0, 0.001),
            LatLng::new(0.001, 0.001),
            LatLng::new(0.001, 0.0),
        ]
    }

    #[test]
    fn circle_contains_nearby_point() {
        let center = LatLng::new(10.0, 124.0);
        let device = LatLng::new(10.0002, 124.0);
        let d = geodesic_distance(device, center);
        assert!((d - 22.2).abs() < 0.5, "got {d}");
        assert!(point_in_circle(device, center, 50.0));
    }

    #[test]
    fn circle_boundary_distance_outside() {
        let center = LatLng::new(10.0, 124.0);
        let device = LatLng::new(10.002, 124.0);
        assert!(!point_in_circle(device, center, 50.0));
        let d = distance_to_circle_boundary(device, center, 50.0);
        assert!((d - 172.4).abs() < 1.0, "got {d}");
    }

    #[test]
    fn circle_test_agrees_with_distance() {
        let center = LatLng::new(8.090881, 123.488679);
        for i in 0..50 {
            let p = LatLng::new(8.090881 + i as f64 * 0.0001, 123.488679 - i as f64 * 0.00005);
            for r in [1.0, 25.0, 100.0, 400.0] {
                assert_eq!(point_in_circle(p, center, r), geodesic_distance(p, center) <= r);
            }
        }
    }

    #[test]
    fn polygon_contains_interior_point() {
        assert!(point_in_polygon(LatLng::new(0.0005, 0.0005), &square()));
        assert!(point_in_polygon(LatLng::new(0.0001, 0.0009), &square()));
    }

    #[test]
    fn polygon_rejects_far_points() {
        assert!(!point_in_polygon(LatLng::new(1.0, 1.0), &square()));
        assert!(!point_in_polygon(LatLng::new(-0.5, 0.0005), &square()));
        assert!(!point_in_polygon(LatLng::new(0.0005, 0.002), &square()));
    }

    #[test]
    fn open_and_closed_rings_agree() {
        let open = square();
        let closed = closed_ring(&open);
        assert_eq!(closed.len(), open.len() + 1);
        assert_eq!(closed_ring(&closed).len(), closed.len());

        let p = LatLng::new(0.0004, 0.0002);
        assert_eq!(point_in_polygon(p, &open), point_in_polygon(p, &closed));
    }

    #[test]
    fn polygon_boundary_distance_to_nearest_edge() {
        // 0.001 degrees of longitude at the equator is ~111.2 m
        let d = distance_to_polygon_boundary(LatLng::new(0.0005, 0.002), &square());
        assert!((d - 111.2).abs() < 0.5, "got {d}");
    }

    #[test]
    fn polygon_boundary_distance_to_corner() {
        let d = distance_to_polygon_boundary(LatLng::new(-0.001, -0.001), &square());
        let corner = geodesic_distance(LatLng::new(-0.001, -0.001), LatLng::new(0.0, 0.0));
        assert!((d - corner).abs() < 0.01);
    }

    #[test]
    fn validity_checks() {
        assert!(LatLng::new(10.0, 124.0).is_valid());
        assert!(!LatLng::new(f64::NAN, 124.0).is_valid());
        assert!(!LatLng::new(91.0, 0.0).is_valid());
        assert!(!LatLng::new(0.0, f64::INFINITY).is_valid());
    }
}
