//! Great-circle distance and the circle heuristics used to pick cached regions.

use crate::{CacheRegion, Coordinate};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
pub const METERS_PER_MILE: f64 = 1609.34;

/// Haversine distance in meters.
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.clamp(0.0, 1.0).sqrt().asin()
}

pub fn circles_overlap(
    center_a: Coordinate,
    radius_a: f64,
    center_b: Coordinate,
    radius_b: f64,
) -> bool {
    distance(center_a, center_b) < radius_a + radius_b
}

/// Linear estimate of how much of the query radius `region` already covers.
///
/// This is not an area ratio: it is how far the region's edge reaches past the
/// query center, relative to the query radius, clamped to [0, 1].
pub fn coverage_fraction(region: &CacheRegion, query_center: Coordinate, query_radius: f64) -> f64 {
    if query_radius <= 0.0 {
        return 0.0;
    }
    let reach = region.radius_meters - distance(region.center, query_center);
    (reach / query_radius).clamp(0.0, 1.0)
}

pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}

pub fn miles_to_meters(miles: f64) -> f64 {
    miles * METERS_PER_MILE
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::RegionKey;

    fn region(center: Coordinate, radius_meters: f64) -> CacheRegion {
        let now = Utc::now();
        CacheRegion {
            key: RegionKey::for_geometry(center, radius_meters),
            center,
            radius_meters,
            created_at: now,
            expires_at: now + Duration::days(7),
            member_ids: BTreeSet::new(),
        }
    }

    fn coordinate() -> impl Strategy<Value = Coordinate> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lng)| Coordinate::new(lat, lng))
    }

    #[test]
    fn known_distance_san_francisco_to_oakland() {
        let sf = Coordinate::new(37.7749, -122.4194);
        let oakland = Coordinate::new(37.8044, -122.2712);

        let d = distance(sf, oakland);
        assert!((d - 13_400.0).abs() < 200.0, "unexpected distance {d}");
    }

    #[test]
    fn circles_touching_do_not_overlap() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 0.01);
        let d = distance(a, b);

        assert!(!circles_overlap(a, d / 2.0, b, d / 2.0));
        assert!(circles_overlap(a, d / 2.0 + 1.0, b, d / 2.0));
    }

    #[test]
    fn coverage_is_full_when_region_contains_query() {
        let center = Coordinate::new(37.7749, -122.4194);
        assert_eq!(coverage_fraction(&region(center, 5_000.0), center, 1_000.0), 1.0);
    }

    #[test]
    fn coverage_is_linear_and_clamped() {
        let center = Coordinate::new(37.7749, -122.4194);
        let cached = region(center, 1_000.0);

        assert!((coverage_fraction(&cached, center, 2_000.0) - 0.5).abs() < 1e-9);

        let far = Coordinate::new(37.8749, -122.4194);
        assert_eq!(coverage_fraction(&cached, far, 2_000.0), 0.0);
        assert_eq!(coverage_fraction(&cached, center, 0.0), 0.0);
    }

    #[test]
    fn mile_conversion_round_trips() {
        assert!((miles_to_meters(10.0) - 16_093.4).abs() < 1e-9);
        assert!((meters_to_miles(1609.34) - 1.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn distance_to_self_is_zero(a in coordinate()) {
            prop_assert_eq!(distance(a, a), 0.0);
        }

        #[test]
        fn distance_is_symmetric(a in coordinate(), b in coordinate()) {
            prop_assert!((distance(a, b) - distance(b, a)).abs() < 1e-6);
        }

        #[test]
        fn circle_overlaps_itself(c in coordinate(), r in 0.001f64..100_000.0) {
            prop_assert!(circles_overlap(c, r, c, r));
        }

        #[test]
        fn coverage_stays_in_unit_interval(
            a in coordinate(),
            b in coordinate(),
            region_radius in 1.0f64..50_000.0,
            query_radius in 1.0f64..50_000.0,
        ) {
            let fraction = coverage_fraction(&region(a, region_radius), b, query_radius);
            prop_assert!((0.0..=1.0).contains(&fraction));
        }
    }
}
