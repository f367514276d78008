pub mod geo;

use std::{collections::BTreeSet, fmt};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Latitude in [-90, 90] and longitude in [-180, 180]. NaN is never valid.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Identity of a cached search circle.
///
/// Derived from the center rounded to 4 decimal places and the radius rounded
/// to the nearest meter, so the same geometry yields the same key across
/// process restarts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(String);

impl RegionKey {
    pub fn for_geometry(center: Coordinate, radius_meters: f64) -> Self {
        let lat = (center.latitude * 10_000.0).round() as i64;
        let lng = (center.longitude * 10_000.0).round() as i64;
        let radius = radius_meters.round() as i64;
        RegionKey(format!("region:{}:{}:{}", lat, lng, radius))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
    pub place_id: String,
    pub name: String,
    pub address: String,
    pub coordinate: Coordinate,
    pub rating: Option<f64>,
    pub rating_count: Option<u32>,
    pub price_level: Option<u8>,
    pub cuisine_tags: Vec<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub photo_refs: Vec<String>,
    /// Meters from the center of the query that produced this value.
    #[serde(skip)]
    pub distance_meters: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub touch_count: u64,
    pub member_regions: BTreeSet<RegionKey>,
}

impl Restaurant {
    /// A record as reported by an upstream search: no popularity history and
    /// no region membership yet.
    pub fn new(
        place_id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        coordinate: Coordinate,
    ) -> Self {
        let now = Utc::now();
        Self {
            place_id: place_id.into(),
            name: name.into(),
            address: address.into(),
            coordinate,
            rating: None,
            rating_count: None,
            price_level: None,
            cuisine_tags: Vec::new(),
            phone: None,
            website: None,
            photo_refs: Vec::new(),
            distance_meters: None,
            created_at: now,
            last_seen_at: now,
            touch_count: 0,
            member_regions: BTreeSet::new(),
        }
    }

    /// Copies every descriptive field from `fresh`, leaving identity,
    /// lineage and membership untouched.
    pub fn overwrite_descriptive(&mut self, fresh: &Restaurant) {
        self.name = fresh.name.clone();
        self.address = fresh.address.clone();
        self.coordinate = fresh.coordinate;
        self.rating = fresh.rating;
        self.rating_count = fresh.rating_count;
        self.price_level = fresh.price_level;
        self.cuisine_tags = fresh.cuisine_tags.clone();
        self.phone = fresh.phone.clone();
        self.website = fresh.website.clone();
        self.photo_refs = fresh.photo_refs.clone();
        self.distance_meters = fresh.distance_meters;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
        self.touch_count += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRegion {
    pub key: RegionKey,
    pub center: Coordinate,
    pub radius_meters: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub member_ids: BTreeSet<String>,
}

impl CacheRegion {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A region may serve a cache hit only while unexpired and populated.
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.member_ids.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Fresh,
    Stale,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Cache => f.write_str("cache"),
            Provenance::Fresh => f.write_str("fresh"),
            Provenance::Stale => f.write_str("stale"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryResult {
    pub restaurants: Vec<Restaurant>,
    pub provenance: Provenance,
    pub region_key: RegionKey,
    pub total_found: usize,
}

/// Writes applied together in a single store transaction.
#[derive(Debug, Default)]
pub struct Batch {
    pub put_regions: Vec<CacheRegion>,
    pub delete_regions: Vec<RegionKey>,
    pub put_restaurants: Vec<Restaurant>,
    pub delete_restaurants: Vec<String>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.put_regions.is_empty()
            && self.delete_regions.is_empty()
            && self.put_restaurants.is_empty()
            && self.delete_restaurants.is_empty()
    }
}

pub trait Store: Send + Sync {
    fn region(&self, key: &RegionKey) -> Result<Option<CacheRegion>>;
    fn find_regions(&self, predicate: &dyn Fn(&CacheRegion) -> bool) -> Result<Vec<CacheRegion>>;
    /// Ids without a stored record are skipped.
    fn restaurants(&self, place_ids: &[String]) -> Result<Vec<Restaurant>>;
    fn find_restaurants(
        &self,
        predicate: &dyn Fn(&Restaurant) -> bool,
    ) -> Result<Vec<Restaurant>>;
    fn commit(&self, batch: Batch) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn region_key_is_stable_within_rounding() {
        let center = Coordinate::new(37.7749, -122.4194);
        let key = RegionKey::for_geometry(center, 16093.0);

        assert_eq!(key.as_str(), "region:377749:-1224194:16093");
        assert_eq!(
            key,
            RegionKey::for_geometry(Coordinate::new(37.77491, -122.4194), 16093.2)
        );
        assert_ne!(
            key,
            RegionKey::for_geometry(Coordinate::new(37.7750, -122.4194), 16093.0)
        );
        assert_ne!(key, RegionKey::for_geometry(center, 16094.0));
    }

    #[test]
    fn coordinate_validation_rejects_out_of_range() {
        assert!(Coordinate::new(90.0, 180.0).is_valid());
        assert!(Coordinate::new(-90.0, -180.0).is_valid());
        assert!(!Coordinate::new(90.5, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.1).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn distance_is_not_persisted() {
        let mut restaurant = Restaurant::new(
            "abc",
            "Tartine",
            "600 Guerrero St",
            Coordinate::new(37.76, -122.42),
        );
        restaurant.distance_meters = Some(42.0);

        let json = serde_json::to_string(&restaurant).unwrap();
        let decoded: Restaurant = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.distance_meters, None);
        assert_eq!(decoded.place_id, "abc");
    }

    #[test]
    fn overwrite_keeps_lineage() {
        let mut existing = Restaurant::new("p1", "Old", "Old St", Coordinate::new(1.0, 1.0));
        existing.touch_count = 4;
        let created = existing.created_at;

        let mut fresh = Restaurant::new("p1", "New", "New St", Coordinate::new(1.0, 1.0));
        fresh.rating = Some(4.5);
        existing.overwrite_descriptive(&fresh);

        assert_eq!(existing.name, "New");
        assert_eq!(existing.rating, Some(4.5));
        assert_eq!(existing.touch_count, 4);
        assert_eq!(existing.created_at, created);
    }

    proptest! {
        #[test]
        fn region_key_ignores_sub_precision_jitter(
            lat_e4 in -890_000i64..890_000,
            lng_e4 in -1_790_000i64..1_790_000,
            radius in 1u32..50_000,
            jitter in -0.00003f64..0.00003,
        ) {
            let lat = lat_e4 as f64 / 10_000.0;
            let lng = lng_e4 as f64 / 10_000.0;
            let a = RegionKey::for_geometry(Coordinate::new(lat, lng), radius as f64);
            let b = RegionKey::for_geometry(Coordinate::new(lat + jitter, lng), radius as f64);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn region_key_changes_across_a_precision_step(
            lat_e4 in -890_000i64..890_000,
            lng_e4 in -1_790_000i64..1_790_000,
            radius in 1u32..50_000,
        ) {
            let lat = lat_e4 as f64 / 10_000.0;
            let lng = lng_e4 as f64 / 10_000.0;
            let a = RegionKey::for_geometry(Coordinate::new(lat, lng), radius as f64);
            let b = RegionKey::for_geometry(Coordinate::new(lat + 0.0001, lng), radius as f64);
            prop_assert_ne!(a, b);
        }
    }
}
