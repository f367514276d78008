use anyhow::Result;
use async_trait::async_trait;
use context_server::{Tool, ToolContent, ToolExecutor};
use region_cache::CacheOrchestrator;
use serde_json::{Value, json};

pub struct ClearRestaurantCacheTool {
    orchestrator: CacheOrchestrator,
}

impl ClearRestaurantCacheTool {
    pub fn new(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ToolExecutor for ClearRestaurantCacheTool {
    async fn execute(&self, _arguments: Option<Value>) -> Result<Vec<ToolContent>> {
        log::debug!("Executing ClearRestaurantCacheTool");
        self.orchestrator.clear_all().await?;

        Ok(vec![ToolContent::Text {
            text: String::from(
                "Restaurant cache cleared. The next search will query Google Places.",
            ),
        }])
    }

    fn to_tool(&self) -> Tool {
        Tool {
            name: "clear_restaurant_cache".into(),
            description: Some(
                "Delete every cached region and restaurant and forget the last search location"
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }
}
