use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum CacheError {
    #[error("invalid coordinate: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("invalid search radius: {radius}")]
    InvalidRadius { radius: f64 },

    #[error("restaurant search unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("no cached restaurants available: {upstream}")]
    NoCacheAvailable {
        #[source]
        upstream: Box<CacheError>,
    },

    #[error("unknown place: {place_id}")]
    UnknownPlace { place_id: String },

    #[error("cache store failure: {0}")]
    StoreFailure(String),
}

impl CacheError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        CacheError::StoreFailure(format!("{:#}", err))
    }

    pub(crate) fn upstream(err: anyhow::Error) -> Self {
        CacheError::UpstreamUnavailable(format!("{:#}", err))
    }
}
