use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cache::Provenance;
use context_server::{Tool, ToolContent, ToolExecutor};
use region_cache::{CacheOrchestrator, PlaceDetails};
use serde_json::{Value, json};

use crate::find_restaurants::push_restaurant_fields;

pub struct RestaurantDetailsTool {
    orchestrator: CacheOrchestrator,
}

impl RestaurantDetailsTool {
    pub fn new(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }
}

fn format_details(details: &PlaceDetails) -> String {
    let restaurant = &details.restaurant;
    let mut text = format!("{}\n", restaurant.name);
    push_restaurant_fields(&mut text, restaurant);

    if !restaurant.photo_refs.is_empty() {
        text.push_str(&format!(
            "   Photo references: {}\n",
            restaurant.photo_refs.join(", ")
        ));
    }

    if details.provenance == Provenance::Stale {
        text.push_str("\nGoogle Places is unavailable; showing the cached record.");
    }

    text
}

#[async_trait]
impl ToolExecutor for RestaurantDetailsTool {
    async fn execute(&self, arguments: Option<Value>) -> Result<Vec<ToolContent>> {
        log::debug!("Executing RestaurantDetailsTool");
        let args = arguments.ok_or_else(|| anyhow!("Missing arguments"))?;

        let place_id = args
            .get("place_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing or invalid place_id parameter"))?;

        let details = self.orchestrator.restaurant_details(place_id).await?;

        Ok(vec![ToolContent::Text {
            text: format_details(&details),
        }])
    }

    fn to_tool(&self) -> Tool {
        Tool {
            name: "restaurant_details".into(),
            description: Some(
                "Get phone number, website and other details for one restaurant by its Google place ID, and update the cached record".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "place_id": {
                        "type": "string",
                        "description": "Google place ID, as shown by find_restaurants"
                    }
                },
                "required": ["place_id"]
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use cache::{Coordinate, Restaurant};

    use super::*;

    fn details(provenance: Provenance) -> PlaceDetails {
        let mut restaurant = Restaurant::new(
            "ChIJ1",
            "Zuni Cafe",
            "1658 Market St",
            Coordinate::new(37.7735, -122.4216),
        );
        restaurant.phone = Some("(415) 552-2522".into());
        restaurant.website = Some("https://zunicafe.com/".into());
        restaurant.photo_refs = vec!["p1".into()];
        PlaceDetails {
            restaurant,
            provenance,
        }
    }

    #[test]
    fn renders_contact_fields() {
        let text = format_details(&details(Provenance::Fresh));

        assert!(text.starts_with("Zuni Cafe\n"));
        assert!(text.contains("   Phone: (415) 552-2522\n"));
        assert!(text.contains("   Website: https://zunicafe.com/\n"));
        assert!(text.contains("   Photo references: p1\n"));
        assert!(!text.contains("unavailable"));
    }

    #[test]
    fn stale_details_are_labelled() {
        let text = format_details(&details(Provenance::Stale));
        assert!(text.ends_with("showing the cached record."));
    }
}
