use std::path::Path;

use anyhow::Result;
use config::{Config, Environment, File};
use region_cache::CacheConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "RESTAURANT_FINDER";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub store: StoreSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// LMDB map size; the store picks its own default when unset.
    pub map_size_mb: Option<usize>,
}

impl Settings {
    /// Reads `config.toml` from `config_dir` when present, then
    /// `RESTAURANT_FINDER__SECTION__KEY` environment variables.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
