//! Merging freshly fetched restaurants into what the cache already knows.
//!
//! Upstream data is authoritative for descriptive fields. Identity, creation
//! time and the touch counter of a known restaurant carry over from the stored
//! record, so every merge returns updated copies of existing values rather
//! than fresh records under an old id. Every restaurant a merge returns has
//! been touched exactly once.

use std::{cmp::Ordering, collections::HashMap};

use cache::{Coordinate, Restaurant, geo};
use chrono::{DateTime, Utc};

/// Combines `fresh` with `existing` into one list without duplicate place ids.
///
/// Existing restaurants are kept only while they still lie within `radius` of
/// `center`; fresh restaurants are trusted as-is. When a place id appears more
/// than once in `fresh`, the last occurrence wins.
pub fn merge(
    fresh: Vec<Restaurant>,
    existing: Vec<Restaurant>,
    center: Coordinate,
    radius: f64,
    now: DateTime<Utc>,
) -> Vec<Restaurant> {
    let mut latest: HashMap<String, Restaurant> = HashMap::with_capacity(fresh.len());
    for restaurant in fresh {
        latest.insert(restaurant.place_id.clone(), restaurant);
    }

    let mut merged: HashMap<String, Restaurant> = existing
        .into_iter()
        .map(|restaurant| (restaurant.place_id.clone(), restaurant))
        .collect();

    // Stored membership may be stale, so re-check distance. A record the
    // fresh set also reports is kept regardless to carry its lineage over.
    merged.retain(|place_id, restaurant| {
        let distance = geo::distance(center, restaurant.coordinate);
        restaurant.distance_meters = Some(distance);
        distance <= radius || latest.contains_key(place_id)
    });
    for (place_id, restaurant) in merged.iter_mut() {
        if !latest.contains_key(place_id) {
            restaurant.touch(now);
        }
    }

    for (place_id, mut incoming) in latest {
        incoming.distance_meters = Some(geo::distance(center, incoming.coordinate));
        let restaurant = match merged.remove(&place_id) {
            Some(mut current) => {
                current.overwrite_descriptive(&incoming);
                current.touch(now);
                current
            }
            None => {
                incoming.touch_count = 1;
                incoming.last_seen_at = now;
                incoming
            }
        };
        merged.insert(place_id, restaurant);
    }

    let mut restaurants: Vec<Restaurant> = merged.into_values().collect();
    sort_by_distance(&mut restaurants);
    restaurants
}

pub fn annotate_distance(restaurants: &mut [Restaurant], center: Coordinate) {
    for restaurant in restaurants {
        restaurant.distance_meters = Some(geo::distance(center, restaurant.coordinate));
    }
}

/// Nearest first; equal distances put the higher rating first.
pub fn sort_by_distance(restaurants: &mut [Restaurant]) {
    restaurants.sort_by(|a, b| {
        let da = a.distance_meters.unwrap_or(f64::MAX);
        let db = b.distance_meters.unwrap_or(f64::MAX);
        da.partial_cmp(&db)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let ra = a.rating.unwrap_or(0.0);
                let rb = b.rating.unwrap_or(0.0);
                rb.partial_cmp(&ra).unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.place_id.cmp(&b.place_id))
    });
}
