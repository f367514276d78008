use std::{fs, path::Path};

use anyhow::Result;
use cache::{Batch, CacheRegion, RegionKey, Restaurant, Store};
use heed::{
    Database, Env, EnvOpenOptions,
    types::{SerdeJson, Str},
};

const DEFAULT_MAP_SIZE_MB: usize = 64;

/// LMDB-backed region and restaurant tables.
///
/// Restaurants are keyed by place id and regions by region key; regions only
/// reference restaurants by id.
pub struct LocalStore {
    env: Env,
    regions: Database<Str, SerdeJson<CacheRegion>>,
    restaurants: Database<Str, SerdeJson<Restaurant>>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(path: P, map_size_mb: Option<usize>) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb.unwrap_or(DEFAULT_MAP_SIZE_MB) * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())?
        };

        let mut wtxn = env.write_txn()?;
        let regions = env.create_database(&mut wtxn, Some("regions"))?;
        let restaurants = env.create_database(&mut wtxn, Some("restaurants"))?;
        wtxn.commit()?;

        Ok(LocalStore {
            env,
            regions,
            restaurants,
        })
    }

    pub fn region_count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.regions.len(&rtxn)?)
    }

    pub fn restaurant_count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.restaurants.len(&rtxn)?)
    }
}

impl Store for LocalStore {
    fn region(&self, key: &RegionKey) -> Result<Option<CacheRegion>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.regions.get(&rtxn, key.as_str())?)
    }

    fn find_regions(&self, predicate: &dyn Fn(&CacheRegion) -> bool) -> Result<Vec<CacheRegion>> {
        let rtxn = self.env.read_txn()?;
        let mut found = Vec::new();
        for item in self.regions.iter(&rtxn)? {
            let (_, region) = item?;
            if predicate(&region) {
                found.push(region);
            }
        }
        Ok(found)
    }

    fn restaurants(&self, place_ids: &[String]) -> Result<Vec<Restaurant>> {
        let rtxn = self.env.read_txn()?;
        let mut found = Vec::with_capacity(place_ids.len());
        for place_id in place_ids {
            match self.restaurants.get(&rtxn, place_id)? {
                Some(restaurant) => found.push(restaurant),
                None => log::debug!("Restaurant {} missing from store", place_id),
            }
        }
        Ok(found)
    }

    fn find_restaurants(
        &self,
        predicate: &dyn Fn(&Restaurant) -> bool,
    ) -> Result<Vec<Restaurant>> {
        let rtxn = self.env.read_txn()?;
        let mut found = Vec::new();
        for item in self.restaurants.iter(&rtxn)? {
            let (_, restaurant) = item?;
            if predicate(&restaurant) {
                found.push(restaurant);
            }
        }
        Ok(found)
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut wtxn = self.env.write_txn()?;
        for restaurant in &batch.put_restaurants {
            self.restaurants
                .put(&mut wtxn, &restaurant.place_id, restaurant)?;
        }
        for region in &batch.put_regions {
            self.regions.put(&mut wtxn, region.key.as_str(), region)?;
        }
        for key in &batch.delete_regions {
            self.regions.delete(&mut wtxn, key.as_str())?;
        }
        for place_id in &batch.delete_restaurants {
            self.restaurants.delete(&mut wtxn, place_id)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.regions.clear(&mut wtxn)?;
        self.restaurants.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }
}
