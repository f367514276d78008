use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cache::{
    Batch, CacheRegion, Coordinate, Provenance, QueryResult, RegionKey, Restaurant, Store, geo,
};
use chrono::{DateTime, Utc};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
    lock::Mutex,
};
use search::RestaurantSearch;
use serde::Serialize;

use crate::{CacheConfig, CacheError, CacheRegistry, reconcile};

type FreshFetch = Shared<BoxFuture<'static, Result<QueryResult, CacheError>>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_regions: usize,
    pub evicted_regions: usize,
    pub orphaned_restaurants: usize,
}

/// One restaurant with its contact fields, and where it came from.
#[derive(Clone, Debug, Serialize)]
pub struct PlaceDetails {
    pub restaurant: Restaurant,
    pub provenance: Provenance,
}

#[derive(Debug, Default)]
struct Session {
    last_location: Option<Coordinate>,
    last_radius: Option<f64>,
    /// Ticket of the newest query that moved the session.
    ticket: u64,
}

#[derive(Debug)]
enum QueryState {
    Init,
    CacheLookup,
    CacheHit(CacheRegion),
    ReloadNeeded,
    /// Upstream fetch plus merge, shared by every caller for the same key.
    FreshFetchInFlight,
    StaleFallback(CacheError),
    Failed(CacheError),
    Done(QueryResult),
}

impl QueryState {
    fn name(&self) -> &'static str {
        match self {
            QueryState::Init => "init",
            QueryState::CacheLookup => "cache-lookup",
            QueryState::CacheHit(_) => "cache-hit",
            QueryState::ReloadNeeded => "reload-needed",
            QueryState::FreshFetchInFlight => "fresh-fetch",
            QueryState::StaleFallback(_) => "stale-fallback",
            QueryState::Failed(_) => "failed",
            QueryState::Done(_) => "done",
        }
    }
}

/// Answers location queries from cached regions or the upstream search.
///
/// One orchestrator is meant to live for one user session: it owns the
/// position and radius of the last fresh fetch, which drive the reload
/// decision. Clones share that state. Dropping the last clone ends the
/// session; cached data stays in the store.
///
/// Every read-modify-write against the store (merges, cache-hit touches,
/// maintenance, clearing) runs under one write lock, so none of them can
/// overwrite another's changes.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: CacheRegistry,
    store: Arc<dyn Store>,
    search: Arc<dyn RestaurantSearch>,
    config: CacheConfig,
    session: Mutex<Session>,
    next_ticket: AtomicU64,
    in_flight: Mutex<HashMap<RegionKey, (u64, FreshFetch)>>,
    /// Held for every store mutation. The value counts `clear_all` calls, so
    /// a fetch started before a clear never writes after it.
    writes: std::sync::Mutex<u64>,
}

impl CacheOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        search: Arc<dyn RestaurantSearch>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: CacheRegistry::new(store.clone(), config.region_ttl()),
                store,
                search,
                config,
                session: Mutex::new(Session::default()),
                next_ticket: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                writes: std::sync::Mutex::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub async fn query(
        &self,
        location: Coordinate,
        radius: f64,
        force_reload: bool,
    ) -> Result<QueryResult, CacheError> {
        validate(location, radius)?;
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = QueryState::Init;
        loop {
            log::debug!("Query at {:?} r={}m: {}", location, radius, state.name());
            state = match state {
                QueryState::Init => {
                    if self.needs_reload(location, radius, force_reload).await {
                        QueryState::ReloadNeeded
                    } else {
                        QueryState::CacheLookup
                    }
                }
                QueryState::CacheLookup => {
                    match self
                        .inner
                        .registry
                        .find_best_region(location, radius, Utc::now())
                    {
                        Ok(Some(region)) => QueryState::CacheHit(region),
                        Ok(None) => QueryState::ReloadNeeded,
                        Err(err) => {
                            log::warn!("Cache lookup failed, reloading: {}", err);
                            QueryState::ReloadNeeded
                        }
                    }
                }
                QueryState::CacheHit(region) => {
                    match self.inner.serve_cached(&region, location, radius) {
                        Ok(result) => {
                            self.schedule_maintenance();
                            QueryState::Done(result)
                        }
                        Err(err) => {
                            log::warn!("Reading region {} failed, reloading: {}", region.key, err);
                            QueryState::ReloadNeeded
                        }
                    }
                }
                QueryState::ReloadNeeded => QueryState::FreshFetchInFlight,
                QueryState::FreshFetchInFlight => match self.fetch_fresh(location, radius).await {
                    Ok(result) => {
                        self.record_fetch(ticket, location, radius).await;
                        self.schedule_maintenance();
                        QueryState::Done(result)
                    }
                    Err(err @ CacheError::UpstreamUnavailable(_)) => QueryState::StaleFallback(err),
                    Err(err) => QueryState::Failed(err),
                },
                QueryState::StaleFallback(upstream) => {
                    match self.inner.serve_stale(location, radius) {
                        Ok(Some(result)) => QueryState::Done(result),
                        Ok(None) => QueryState::Failed(CacheError::NoCacheAvailable {
                            upstream: Box::new(upstream),
                        }),
                        Err(err) => {
                            log::warn!("Stale fallback failed: {}", err);
                            QueryState::Failed(CacheError::NoCacheAvailable {
                                upstream: Box::new(upstream),
                            })
                        }
                    }
                }
                QueryState::Failed(err) => {
                    log::debug!("Query failed: {}", err);
                    return Err(err);
                }
                QueryState::Done(result) => {
                    log::debug!(
                        "Query served {} restaurants from {} ({})",
                        result.total_found,
                        result.provenance,
                        result.region_key
                    );
                    return Ok(result);
                }
            };
        }
    }

    /// Queries upstream regardless of the last query position.
    pub async fn force_reload(
        &self,
        location: Coordinate,
        radius: f64,
    ) -> Result<QueryResult, CacheError> {
        self.inner.session.lock().await.last_location = None;
        self.query(location, radius, true).await
    }

    /// Looks one restaurant up upstream and stores the result, keeping the
    /// lineage of a record already in the cache. Serves the stored record
    /// when upstream is unreachable.
    pub async fn restaurant_details(&self, place_id: &str) -> Result<PlaceDetails, CacheError> {
        if place_id.trim().is_empty() {
            return Err(CacheError::UnknownPlace {
                place_id: place_id.to_string(),
            });
        }

        let timeout = self.inner.config.upstream_timeout();
        let fetched = match tokio::time::timeout(timeout, self.inner.search.details(place_id)).await
        {
            Ok(Ok(fetched)) => Ok(fetched),
            Ok(Err(err)) => Err(CacheError::upstream(err)),
            Err(_) => Err(timed_out(timeout)),
        };

        match fetched {
            Ok(Some(fresh)) => Ok(PlaceDetails {
                restaurant: self.inner.store_details(fresh)?,
                provenance: Provenance::Fresh,
            }),
            Ok(None) => Err(CacheError::UnknownPlace {
                place_id: place_id.to_string(),
            }),
            Err(upstream) => {
                let stored = self
                    .inner
                    .store
                    .restaurants(&[place_id.to_string()])
                    .map_err(CacheError::store)?;
                match stored.into_iter().next() {
                    Some(restaurant) => {
                        log::info!("Serving stored details for {}: {}", place_id, upstream);
                        Ok(PlaceDetails {
                            restaurant,
                            provenance: Provenance::Stale,
                        })
                    }
                    None => Err(CacheError::NoCacheAvailable {
                        upstream: Box::new(upstream),
                    }),
                }
            }
        }
    }

    /// Drops every region and restaurant and forgets the last query. Fetches
    /// still in flight finish for their callers but are not persisted.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        {
            let mut generation = self.inner.lock_writes();
            self.inner.registry.clear()?;
            *generation += 1;
        }
        self.inner.in_flight.lock().await.clear();
        *self.inner.session.lock().await = Session {
            ticket: self.inner.next_ticket.load(Ordering::SeqCst),
            ..Default::default()
        };
        log::info!("Restaurant cache cleared");
        Ok(())
    }

    pub fn run_maintenance(&self) -> Result<MaintenanceReport, CacheError> {
        self.inner.maintain(Utc::now())
    }

    async fn needs_reload(&self, location: Coordinate, radius: f64, force_reload: bool) -> bool {
        if force_reload {
            return true;
        }

        let session = self.inner.session.lock().await;
        match (session.last_location, session.last_radius) {
            (Some(last_location), Some(last_radius)) => {
                geo::distance(location, last_location) >= self.inner.config.reload_distance_meters
                    || (radius - last_radius).abs() > self.inner.config.radius_change_meters
            }
            _ => true,
        }
    }

    /// Moves the session to this query's position unless a query issued
    /// later already did.
    async fn record_fetch(&self, ticket: u64, location: Coordinate, radius: f64) {
        let mut session = self.inner.session.lock().await;
        if ticket > session.ticket {
            session.last_location = Some(location);
            session.last_radius = Some(radius);
            session.ticket = ticket;
        }
    }

    /// Runs at most one fetch per region key. The work is spawned, so it
    /// still completes and persists when every caller has gone away.
    async fn fetch_fresh(
        &self,
        location: Coordinate,
        radius: f64,
    ) -> Result<QueryResult, CacheError> {
        let key = RegionKey::for_geometry(location, radius);

        let pending = {
            let mut in_flight = self.inner.in_flight.lock().await;
            let generation = *self.inner.lock_writes();
            match in_flight.get(&key) {
                Some((started, pending)) if *started == generation => {
                    log::debug!("Joining in-flight fetch for {}", key);
                    pending.clone()
                }
                _ => {
                    let inner = self.inner.clone();
                    let task_key = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = inner.fetch_and_merge(location, radius, generation).await;
                        inner.finish_fetch(&task_key, generation).await;
                        result
                    });

                    let inner = self.inner.clone();
                    let task_key = key.clone();
                    let pending = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(err) => {
                                inner.finish_fetch(&task_key, generation).await;
                                Err(CacheError::UpstreamUnavailable(format!(
                                    "fetch task aborted: {}",
                                    err
                                )))
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(key, (generation, pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    fn schedule_maintenance(&self) {
        if !self.inner.config.background_maintenance {
            return;
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = inner.maintain(Utc::now()) {
                log::warn!("Cache maintenance failed: {}", err);
            }
        });
    }
}

impl Inner {
    fn lock_writes(&self) -> MutexGuard<'_, u64> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn finish_fetch(&self, key: &RegionKey, generation: u64) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(key)
            .is_some_and(|(started, _)| *started == generation)
        {
            in_flight.remove(key);
        }
    }

    async fn fetch_and_merge(
        &self,
        location: Coordinate,
        radius: f64,
        generation: u64,
    ) -> Result<QueryResult, CacheError> {
        let timeout = self.config.upstream_timeout();
        let fetched =
            match tokio::time::timeout(timeout, self.search.search(location, radius)).await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(err)) => return Err(CacheError::upstream(err)),
                Err(_) => return Err(timed_out(timeout)),
            };

        self.merge_and_commit(fetched, location, radius, generation)
    }

    fn merge_and_commit(
        &self,
        fetched: Vec<Restaurant>,
        location: Coordinate,
        radius: f64,
        generation: u64,
    ) -> Result<QueryResult, CacheError> {
        log::debug!("Merging {} fetched restaurants", fetched.len());
        let writes = self.lock_writes();
        let now = Utc::now();

        let mut known_ids: BTreeSet<String> = self
            .registry
            .find_overlapping_regions(location, radius, now)?
            .into_iter()
            .flat_map(|region| region.member_ids)
            .collect();
        known_ids.extend(fetched.iter().map(|r| r.place_id.clone()));
        let existing = self
            .store
            .restaurants(&known_ids.into_iter().collect::<Vec<_>>())
            .map_err(CacheError::store)?;

        let mut merged = reconcile::merge(fetched, existing, location, radius, now);
        let member_ids: BTreeSet<String> = merged.iter().map(|r| r.place_id.clone()).collect();
        let (region, previous) = self
            .registry
            .prepare_upsert(location, radius, member_ids, now)?;

        let mut batch = Batch::default();
        if let Some(previous) = previous {
            let dropped: Vec<String> = previous
                .member_ids
                .difference(&region.member_ids)
                .cloned()
                .collect();
            if !dropped.is_empty() {
                for mut restaurant in self.store.restaurants(&dropped).map_err(CacheError::store)? {
                    restaurant.member_regions.remove(&region.key);
                    batch.put_restaurants.push(restaurant);
                }
            }
        }
        for restaurant in merged.iter_mut() {
            restaurant.member_regions.insert(region.key.clone());
        }
        batch.put_restaurants.extend(merged.iter().cloned());
        batch.put_regions.push(region.clone());

        if *writes == generation {
            self.store.commit(batch).map_err(CacheError::store)?;
        } else {
            log::debug!("Cache cleared during fetch for {}, not storing", region.key);
        }

        Ok(QueryResult {
            total_found: merged.len(),
            restaurants: merged,
            provenance: Provenance::Fresh,
            region_key: region.key,
        })
    }

    fn serve_cached(
        &self,
        region: &CacheRegion,
        location: Coordinate,
        radius: f64,
    ) -> Result<QueryResult, CacheError> {
        let _writes = self.lock_writes();
        let ids: Vec<String> = region.member_ids.iter().cloned().collect();
        let mut restaurants = self.store.restaurants(&ids).map_err(CacheError::store)?;
        if restaurants.is_empty() {
            return Err(CacheError::StoreFailure(format!(
                "no stored members for region {}",
                region.key
            )));
        }

        reconcile::annotate_distance(&mut restaurants, location);
        restaurants.retain(|r| r.distance_meters.is_some_and(|d| d <= radius));

        let now = Utc::now();
        for restaurant in restaurants.iter_mut() {
            restaurant.touch(now);
        }
        if let Err(err) = self.store.commit(Batch {
            put_restaurants: restaurants.clone(),
            ..Default::default()
        }) {
            log::warn!("Failed to record cache hit touches: {:#}", err);
        }

        reconcile::sort_by_distance(&mut restaurants);
        Ok(QueryResult {
            total_found: restaurants.len(),
            restaurants,
            provenance: Provenance::Cache,
            region_key: region.key.clone(),
        })
    }

    fn serve_stale(
        &self,
        location: Coordinate,
        radius: f64,
    ) -> Result<Option<QueryResult>, CacheError> {
        let Some(region) = self.registry.most_recent_overlapping(location, radius)? else {
            return Ok(None);
        };

        let ids: Vec<String> = region.member_ids.iter().cloned().collect();
        let mut restaurants = self.store.restaurants(&ids).map_err(CacheError::store)?;
        if restaurants.is_empty() {
            return Ok(None);
        }

        log::info!(
            "Serving {} stale restaurants from region {}",
            restaurants.len(),
            region.key
        );
        reconcile::annotate_distance(&mut restaurants, location);
        reconcile::sort_by_distance(&mut restaurants);
        Ok(Some(QueryResult {
            total_found: restaurants.len(),
            restaurants,
            provenance: Provenance::Stale,
            region_key: region.key,
        }))
    }

    fn store_details(&self, fresh: Restaurant) -> Result<Restaurant, CacheError> {
        let _writes = self.lock_writes();
        let now = Utc::now();

        let restaurant = match self
            .store
            .restaurants(&[fresh.place_id.clone()])
            .map_err(CacheError::store)?
            .into_iter()
            .next()
        {
            Some(mut stored) => {
                stored.overwrite_descriptive(&fresh);
                stored.touch(now);
                stored
            }
            None => Restaurant {
                touch_count: 1,
                last_seen_at: now,
                ..fresh
            },
        };

        self.store
            .commit(Batch {
                put_restaurants: vec![restaurant.clone()],
                ..Default::default()
            })
            .map_err(CacheError::store)?;
        Ok(restaurant)
    }

    fn maintain(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, CacheError> {
        let _writes = self.lock_writes();
        let report = MaintenanceReport {
            expired_regions: self.registry.sweep_expired(now)?,
            evicted_regions: self.registry.enforce_capacity(self.config.max_regions)?,
            orphaned_restaurants: self
                .registry
                .evict_orphans(now, self.config.orphan_ttl())?,
        };
        if report != MaintenanceReport::default() {
            log::info!(
                "Cache maintenance: {} expired, {} evicted, {} orphaned",
                report.expired_regions,
                report.evicted_regions,
                report.orphaned_restaurants
            );
        }
        Ok(report)
    }
}

fn timed_out(timeout: Duration) -> CacheError {
    CacheError::UpstreamUnavailable(format!(
        "search timed out after {}s",
        timeout.as_secs()
    ))
}

fn validate(location: Coordinate, radius: f64) -> Result<(), CacheError> {
    if !location.is_valid() {
        return Err(CacheError::InvalidCoordinate {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }
    if !radius.is_finite() || radius <= 0.0 {
        return Err(CacheError::InvalidRadius { radius });
    }
    Ok(())
}
