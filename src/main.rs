mod settings;

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cache::{Coordinate, Restaurant};
use context_server::{ContextServer, ContextServerRpcRequest, ContextServerRpcResponse};
use context_server_utils::{
    prompt_registry::PromptRegistry, resource_registry::ResourceRegistry,
    tool_registry::ToolRegistry,
};
use directories::ProjectDirs;
use google_places::{GooglePlaces, RateLimiter};
use http_client::HttpClient;
use http_client_reqwest::HttpClientReqwest;
use local_cache::LocalStore;
use region_cache::CacheOrchestrator;
use restaurant_finder_mcp_tools::{
    ClearRestaurantCacheTool, FindRestaurantsTool, RestaurantDetailsTool,
};
use search::RestaurantSearch;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

const API_KEY_VAR: &str = "GOOGLE_PLACES_API_KEY";

struct ContextServerState {
    rpc: ContextServer,
}

/// Stands in for Google Places when no API key is configured, so queries
/// still fall back to whatever is cached.
struct MissingApiKey;

#[async_trait]
impl RestaurantSearch for MissingApiKey {
    async fn search(&self, _center: Coordinate, _radius_meters: f64) -> Result<Vec<Restaurant>> {
        Err(anyhow!("{} is not set", API_KEY_VAR))
    }

    async fn details(&self, _place_id: &str) -> Result<Option<Restaurant>> {
        Err(anyhow!("{} is not set", API_KEY_VAR))
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("code", "fdionisi", "restaurant-finder-mcp")
        .ok_or_else(|| anyhow!("unable to find project directory"))
}

fn database_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("cache.db"))
}

fn restaurant_search(http_client: Arc<dyn HttpClient>) -> Result<Arc<dyn RestaurantSearch>> {
    match env::var(API_KEY_VAR) {
        Ok(api_key) => Ok(Arc::new(
            GooglePlaces::builder()
                .with_http_client(http_client)
                .with_rate_limiter(Arc::new(RateLimiter::new()))
                .with_api_key(api_key)
                .build()?,
        )),
        Err(_) => {
            log::warn!(
                "{} environment variable is not defined; only cached results are available",
                API_KEY_VAR
            );
            Ok(Arc::new(MissingApiKey))
        }
    }
}

impl ContextServerState {
    fn new(http_client: Arc<dyn HttpClient>, settings: Settings) -> Result<Self> {
        let resource_registry = Arc::new(ResourceRegistry::default());

        let tool_registry = Arc::new(ToolRegistry::default());

        let store = Arc::new(LocalStore::new(database_dir()?, settings.store.map_size_mb)?);
        let orchestrator =
            CacheOrchestrator::new(store, restaurant_search(http_client)?, settings.cache);
        tool_registry.register(Arc::new(FindRestaurantsTool::new(orchestrator.clone())));
        tool_registry.register(Arc::new(RestaurantDetailsTool::new(orchestrator.clone())));
        tool_registry.register(Arc::new(ClearRestaurantCacheTool::new(orchestrator)));

        let prompt_registry = Arc::new(PromptRegistry::default());

        Ok(Self {
            rpc: ContextServer::builder()
                .with_server_info((env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
                .with_resources(resource_registry)
                .with_tools(tool_registry)
                .with_prompts(prompt_registry)
                .build()?,
        })
    }

    async fn process_request(
        &self,
        request: ContextServerRpcRequest,
    ) -> Result<Option<ContextServerRpcResponse>> {
        self.rpc.handle_incoming_message(request).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(project_dirs()?.config_dir())?;
    let http_client = Arc::new(HttpClientReqwest::default());

    let state = ContextServerState::new(http_client, settings)?;
    log::info!("{} {} ready", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut stdin = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = stdin.next_line().await? {
        let request: ContextServerRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                log::error!("Error parsing request: {}", e);
                continue;
            }
        };

        if let Some(response) = state.process_request(request).await? {
            let response_json = serde_json::to_string(&response)?;
            stdout.write_all(response_json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
