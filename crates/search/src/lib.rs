use anyhow::Result;
use async_trait::async_trait;
use cache::{Coordinate, Restaurant};

/// A remote nearby-search provider.
///
/// Returned restaurants carry no popularity history or region membership; any
/// failure is treated by callers as the upstream being unavailable.
#[async_trait]
pub trait RestaurantSearch: Send + Sync {
    async fn search(&self, center: Coordinate, radius_meters: f64) -> Result<Vec<Restaurant>>;

    /// Full record for one place, including contact fields a nearby search
    /// leaves out. `None` when the provider does not know the id.
    async fn details(&self, place_id: &str) -> Result<Option<Restaurant>>;
}
