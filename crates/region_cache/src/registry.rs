use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use cache::{Batch, CacheRegion, Coordinate, RegionKey, Store, geo};
use chrono::{DateTime, Duration, Utc};

use crate::CacheError;

const COVERAGE_WEIGHT: f64 = 0.7;
const FRESHNESS_WEIGHT: f64 = 0.3;
// Scores closer than this are ties, decided by coverage and then age.
const SCORE_TOLERANCE: f64 = 1e-9;

/// The set of previously searched circles, backed by the shared store.
///
/// Mutating methods read and then commit separately; callers that mutate
/// concurrently must serialize them.
#[derive(Clone)]
pub struct CacheRegistry {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl CacheRegistry {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn region(&self, key: &RegionKey) -> Result<Option<CacheRegion>, CacheError> {
        self.store.region(key).map_err(CacheError::store)
    }

    /// Unexpired regions whose circle intersects the query circle.
    pub fn find_overlapping_regions(
        &self,
        center: Coordinate,
        radius: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheRegion>, CacheError> {
        self.store
            .find_regions(&|region| {
                !region.is_expired(now)
                    && geo::circles_overlap(region.center, region.radius_meters, center, radius)
            })
            .map_err(CacheError::store)
    }

    /// The overlapping, servable region with the highest blended coverage and
    /// freshness score.
    pub fn find_best_region(
        &self,
        center: Coordinate,
        radius: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheRegion>, CacheError> {
        let candidates = self.find_overlapping_regions(center, radius, now)?;

        let best = candidates
            .into_iter()
            .filter(|region| region.is_servable(now))
            .map(|region| {
                let coverage = geo::coverage_fraction(&region, center, radius);
                let score = COVERAGE_WEIGHT * coverage
                    + FRESHNESS_WEIGHT * self.freshness_fraction(&region, now);
                (score, coverage, region)
            })
            .filter(|(score, _, _)| *score > 0.0)
            .max_by(|a, b| {
                compare_scores(a.0, b.0)
                    .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                    .then_with(|| a.2.created_at.cmp(&b.2.created_at))
            });

        if let Some((score, coverage, region)) = &best {
            log::debug!(
                "Best region {} (score {:.3}, coverage {:.3})",
                region.key,
                score,
                coverage
            );
        }
        Ok(best.map(|(_, _, region)| region))
    }

    /// Remaining lifetime over the full TTL, clamped to [0, 1].
    pub fn freshness_fraction(&self, region: &CacheRegion, now: DateTime<Utc>) -> f64 {
        let full = self.ttl.num_milliseconds();
        if full <= 0 {
            return 0.0;
        }
        let remaining = (region.expires_at - now).num_milliseconds();
        (remaining as f64 / full as f64).clamp(0.0, 1.0)
    }

    /// Builds the region record an upsert would write, together with the
    /// version it replaces.
    pub fn prepare_upsert(
        &self,
        center: Coordinate,
        radius: f64,
        member_ids: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<(CacheRegion, Option<CacheRegion>), CacheError> {
        let key = RegionKey::for_geometry(center, radius);
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let previous = self.region(&key)?;
        let region = match &previous {
            Some(existing) => CacheRegion {
                member_ids,
                expires_at,
                ..existing.clone()
            },
            None => CacheRegion {
                key,
                center,
                radius_meters: radius,
                created_at: now,
                expires_at,
                member_ids,
            },
        };
        Ok((region, previous))
    }

    /// Creates the region for this geometry, or replaces the members and
    /// refreshes the expiry of the one already stored under the same key.
    pub fn upsert_region(
        &self,
        center: Coordinate,
        radius: f64,
        member_ids: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<CacheRegion, CacheError> {
        let (region, _) = self.prepare_upsert(center, radius, member_ids, now)?;
        self.store
            .commit(Batch {
                put_regions: vec![region.clone()],
                ..Default::default()
            })
            .map_err(CacheError::store)?;
        Ok(region)
    }

    /// Newest populated region overlapping the query, expired or not.
    pub fn most_recent_overlapping(
        &self,
        center: Coordinate,
        radius: f64,
    ) -> Result<Option<CacheRegion>, CacheError> {
        let regions = self
            .store
            .find_regions(&|region| {
                !region.member_ids.is_empty()
                    && geo::circles_overlap(region.center, region.radius_meters, center, radius)
            })
            .map_err(CacheError::store)?;
        Ok(regions.into_iter().max_by_key(|region| region.created_at))
    }

    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let expired = self
            .store
            .find_regions(&|region| region.is_expired(now))
            .map_err(CacheError::store)?;
        self.remove_regions(&expired)?;
        Ok(expired.len())
    }

    /// Deletes the oldest regions by creation time until at most
    /// `max_regions` remain.
    pub fn enforce_capacity(&self, max_regions: usize) -> Result<usize, CacheError> {
        let mut regions = self
            .store
            .find_regions(&|_| true)
            .map_err(CacheError::store)?;
        if regions.len() <= max_regions {
            return Ok(0);
        }

        regions.sort_by_key(|region| region.created_at);
        let excess = regions.len() - max_regions;
        regions.truncate(excess);
        self.remove_regions(&regions)?;
        Ok(excess)
    }

    /// Deletes restaurants no region references that have not been seen for
    /// longer than `orphan_ttl`.
    pub fn evict_orphans(
        &self,
        now: DateTime<Utc>,
        orphan_ttl: Duration,
    ) -> Result<usize, CacheError> {
        let referenced: HashSet<String> = self
            .store
            .find_regions(&|_| true)
            .map_err(CacheError::store)?
            .into_iter()
            .flat_map(|region| region.member_ids)
            .collect();
        let cutoff = now
            .checked_sub_signed(orphan_ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let orphans = self
            .store
            .find_restaurants(&|restaurant| {
                !referenced.contains(&restaurant.place_id) && restaurant.last_seen_at < cutoff
            })
            .map_err(CacheError::store)?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let count = orphans.len();
        self.store
            .commit(Batch {
                delete_restaurants: orphans.into_iter().map(|r| r.place_id).collect(),
                ..Default::default()
            })
            .map_err(CacheError::store)?;
        Ok(count)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.clear().map_err(CacheError::store)
    }

    // Deleted keys are stripped from their members in the same commit.
    fn remove_regions(&self, regions: &[CacheRegion]) -> Result<(), CacheError> {
        if regions.is_empty() {
            return Ok(());
        }

        let keys: HashSet<&RegionKey> = regions.iter().map(|region| &region.key).collect();
        let member_ids: Vec<String> = regions
            .iter()
            .flat_map(|region| region.member_ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut batch = Batch::default();
        for mut restaurant in self
            .store
            .restaurants(&member_ids)
            .map_err(CacheError::store)?
        {
            let before = restaurant.member_regions.len();
            restaurant.member_regions.retain(|key| !keys.contains(key));
            if restaurant.member_regions.len() != before {
                batch.put_restaurants.push(restaurant);
            }
        }
        batch.delete_regions = regions.iter().map(|region| region.key.clone()).collect();

        self.store.commit(batch).map_err(CacheError::store)
    }
}

fn compare_scores(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= SCORE_TOLERANCE {
        Ordering::Equal
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}
