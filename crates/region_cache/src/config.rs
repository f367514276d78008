use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REGION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_RELOAD_DISTANCE_METERS: f64 = 1609.0;
const DEFAULT_RADIUS_CHANGE_METERS: f64 = 1000.0;
const DEFAULT_MAX_REGIONS: usize = 50;
const DEFAULT_ORPHAN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a region after its last fresh fetch.
    pub region_ttl_secs: u64,
    /// Moving at least this far from the last query forces a reload.
    pub reload_distance_meters: f64,
    /// Changing the radius by more than this forces a reload.
    pub radius_change_meters: f64,
    pub max_regions: usize,
    /// Unreferenced restaurants untouched for longer than this are evicted.
    pub orphan_ttl_secs: u64,
    pub upstream_timeout_secs: u64,
    /// Run sweep, capacity and orphan eviction after each served query.
    pub background_maintenance: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            region_ttl_secs: DEFAULT_REGION_TTL_SECS,
            reload_distance_meters: DEFAULT_RELOAD_DISTANCE_METERS,
            radius_change_meters: DEFAULT_RADIUS_CHANGE_METERS,
            max_regions: DEFAULT_MAX_REGIONS,
            orphan_ttl_secs: DEFAULT_ORPHAN_TTL_SECS,
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            background_maintenance: true,
        }
    }
}

impl CacheConfig {
    pub fn region_ttl(&self) -> chrono::Duration {
        seconds(self.region_ttl_secs)
    }

    pub fn orphan_ttl(&self) -> chrono::Duration {
        seconds(self.orphan_ttl_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    let max = (i64::MAX / 1_000) as u64;
    chrono::Duration::seconds(secs.min(max) as i64)
}
