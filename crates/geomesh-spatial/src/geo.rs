//! Great-circle distance and polygon containment.

use geomesh_types::{Geometry, Point};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters (haversine formula).
pub fn haversine_distance(a: Point, b: Point) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Even-odd ray casting.
///
/// Latitude is the ray axis. Points exactly on an edge may land on either
/// side. Fewer than three vertices never contain anything.
pub fn is_point_in_polygon(point: Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];
        if (vi.lat > point.lat) != (vj.lat > point.lat)
            && point.lng < (vj.lng - vi.lng) * (point.lat - vi.lat) / (vj.lat - vi.lat) + vi.lng
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Containment test for a fence geometry.
///
/// Malformed or unsupported geometry contains nothing.
pub fn contains(geometry: &Geometry, point: Point) -> bool {
    if !geometry.is_well_formed() {
        return false;
    }
    match geometry {
        Geometry::Circle {
            center,
            radius_meters,
        } => haversine_distance(point, *center) <= *radius_meters,
        Geometry::Polygon { vertices } => is_point_in_polygon(point, vertices),
        Geometry::Unsupported => false,
    }
}
