//! Geospatial restaurant cache.
//!
//! Decides whether previously fetched restaurants can answer a location query,
//! refreshes them from the upstream search when they cannot, and keeps the
//! region and restaurant tables consistent.

mod config;
mod error;
mod orchestrator;
pub mod reconcile;
mod registry;

pub use crate::config::CacheConfig;
pub use crate::error::CacheError;
pub use crate::orchestrator::{CacheOrchestrator, MaintenanceReport, PlaceDetails};
pub use crate::registry::CacheRegistry;
