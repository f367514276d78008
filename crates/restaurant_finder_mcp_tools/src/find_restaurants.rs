use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cache::{Coordinate, Provenance, QueryResult, Restaurant, geo};
use context_server::{Tool, ToolContent, ToolExecutor};
use region_cache::CacheOrchestrator;
use serde_json::{Value, json};

const DEFAULT_RADIUS_MILES: f64 = 10.0;
const MIN_RADIUS_MILES: f64 = 0.1;
const MAX_RADIUS_MILES: f64 = 10.0;
const MAX_RESULTS: u64 = 60;

pub struct FindRestaurantsTool {
    orchestrator: CacheOrchestrator,
}

#[derive(Debug, PartialEq)]
struct FindArguments {
    location: Coordinate,
    radius_miles: f64,
    min_rating: f64,
    max_results: usize,
    force_reload: bool,
}

impl FindRestaurantsTool {
    pub fn new(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }
}

fn parse_arguments(arguments: Option<Value>) -> Result<FindArguments> {
    let args = arguments.ok_or_else(|| anyhow!("Missing arguments"))?;

    let latitude = args
        .get("latitude")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow!("Missing or invalid latitude parameter"))?;
    let longitude = args
        .get("longitude")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow!("Missing or invalid longitude parameter"))?;

    let radius_miles = args
        .get("radius_miles")
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_RADIUS_MILES);
    if !(MIN_RADIUS_MILES..=MAX_RADIUS_MILES).contains(&radius_miles) {
        return Err(anyhow!(
            "radius_miles must be between {} and {}",
            MIN_RADIUS_MILES,
            MAX_RADIUS_MILES
        ));
    }

    let min_rating = args
        .get("min_rating")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    if !(0.0..=5.0).contains(&min_rating) {
        return Err(anyhow!("min_rating must be between 0 and 5"));
    }

    let max_results = args
        .get("max_results")
        .and_then(|v| v.as_u64())
        .unwrap_or(MAX_RESULTS);
    if !(1..=MAX_RESULTS).contains(&max_results) {
        return Err(anyhow!("max_results must be between 1 and {}", MAX_RESULTS));
    }

    let force_reload = args
        .get("force_reload")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(FindArguments {
        location: Coordinate::new(latitude, longitude),
        radius_miles,
        min_rating,
        max_results: max_results as usize,
        force_reload,
    })
}

/// Unrated restaurants only pass when no minimum rating was asked for.
fn select<'a>(
    restaurants: &'a [Restaurant],
    min_rating: f64,
    max_results: usize,
) -> Vec<&'a Restaurant> {
    restaurants
        .iter()
        .filter(|r| match r.rating {
            Some(rating) => rating >= min_rating,
            None => min_rating == 0.0,
        })
        .take(max_results)
        .collect()
}

fn format_results(result: &QueryResult, args: &FindArguments) -> String {
    let source = match result.provenance {
        Provenance::Cache => "cache",
        Provenance::Fresh => "Google Places",
        Provenance::Stale => "stale cache (Google Places unavailable)",
    };

    let selected = select(&result.restaurants, args.min_rating, args.max_results);
    if selected.is_empty() {
        return format!(
            "No restaurants found within {} miles matching your criteria (source: {}, region: {}).",
            args.radius_miles, source, result.region_key
        );
    }

    let mut text = format!(
        "Found {} restaurants within {} miles (source: {}, region: {}). Showing {}:\n\n",
        result.total_found,
        args.radius_miles,
        source,
        result.region_key,
        selected.len()
    );

    for (i, restaurant) in selected.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, restaurant.name));
        push_restaurant_fields(&mut text, restaurant);

        if i < selected.len() - 1 {
            text.push('\n');
        }
    }

    text
}

/// Indented detail lines for one restaurant, below its heading.
pub(crate) fn push_restaurant_fields(text: &mut String, restaurant: &Restaurant) {
    if let Some(meters) = restaurant.distance_meters {
        text.push_str(&format!(
            "   Distance: {:.2} miles\n",
            geo::meters_to_miles(meters)
        ));
    }

    match (restaurant.rating, restaurant.rating_count) {
        (Some(rating), Some(count)) => {
            text.push_str(&format!("   Rating: {:.1} ({} reviews)\n", rating, count))
        }
        (Some(rating), None) => text.push_str(&format!("   Rating: {:.1}\n", rating)),
        (None, _) => text.push_str("   Rating: not rated\n"),
    }

    if let Some(level) = restaurant.price_level {
        let price = if level == 0 {
            String::from("free")
        } else {
            "$".repeat(level as usize)
        };
        text.push_str(&format!("   Price: {}\n", price));
    }

    text.push_str(&format!("   Address: {}\n", restaurant.address));

    if !restaurant.cuisine_tags.is_empty() {
        text.push_str(&format!("   Tags: {}\n", restaurant.cuisine_tags.join(", ")));
    }

    if let Some(phone) = &restaurant.phone {
        text.push_str(&format!("   Phone: {}\n", phone));
    }

    if let Some(website) = &restaurant.website {
        text.push_str(&format!("   Website: {}\n", website));
    }

    text.push_str(&format!("   Place ID: {}\n", restaurant.place_id));
}

#[async_trait]
impl ToolExecutor for FindRestaurantsTool {
    async fn execute(&self, arguments: Option<Value>) -> Result<Vec<ToolContent>> {
        log::debug!("Executing FindRestaurantsTool");
        let args = parse_arguments(arguments)?;
        let radius = geo::miles_to_meters(args.radius_miles);

        let result = if args.force_reload {
            self.orchestrator.force_reload(args.location, radius).await?
        } else {
            self.orchestrator.query(args.location, radius, false).await?
        };

        Ok(vec![ToolContent::Text {
            text: format_results(&result, &args),
        }])
    }

    fn to_tool(&self) -> Tool {
        Tool {
            name: "find_restaurants".into(),
            description: Some(
                "Find restaurants near a location. Results are served from a local cache of previously searched areas when possible, and from Google Places otherwise".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "latitude": {
                        "type": "number",
                        "description": "Latitude of the search center in degrees",
                        "minimum": -90,
                        "maximum": 90
                    },
                    "longitude": {
                        "type": "number",
                        "description": "Longitude of the search center in degrees",
                        "minimum": -180,
                        "maximum": 180
                    },
                    "radius_miles": {
                        "type": "number",
                        "description": "Search radius in miles. Default: 10",
                        "minimum": MIN_RADIUS_MILES,
                        "maximum": MAX_RADIUS_MILES
                    },
                    "min_rating": {
                        "type": "number",
                        "description": "Only return restaurants rated at least this high (0-5). Unrated restaurants are excluded when this is above 0",
                        "minimum": 0,
                        "maximum": 5
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of restaurants to return. Default: 60",
                        "minimum": 1,
                        "maximum": MAX_RESULTS
                    },
                    "force_reload": {
                        "type": "boolean",
                        "description": "Bypass the cache and query Google Places"
                    }
                },
                "required": ["latitude", "longitude"]
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cache::RegionKey;
    use local_cache::LocalStore;
    use region_cache::CacheConfig;
    use search::RestaurantSearch;
    use tempfile::TempDir;

    use super::*;

    const SF: Coordinate = Coordinate {
        latitude: 37.7749,
        longitude: -122.4194,
    };

    fn restaurant(place_id: &str, rating: Option<f64>, distance_meters: f64) -> Restaurant {
        let mut restaurant =
            Restaurant::new(place_id, format!("{} grill", place_id), "Valencia St", SF);
        restaurant.rating = rating;
        restaurant.distance_meters = Some(distance_meters);
        restaurant
    }

    fn arguments(min_rating: f64, max_results: usize) -> FindArguments {
        FindArguments {
            location: SF,
            radius_miles: 10.0,
            min_rating,
            max_results,
            force_reload: false,
        }
    }

    fn result(restaurants: Vec<Restaurant>, provenance: Provenance) -> QueryResult {
        QueryResult {
            total_found: restaurants.len(),
            restaurants,
            provenance,
            region_key: RegionKey::for_geometry(SF, 16_093.4),
        }
    }

    #[test]
    fn arguments_use_defaults() {
        let args = parse_arguments(Some(json!({ "latitude": 37.7749, "longitude": -122.4194 })))
            .unwrap();
        assert_eq!(args, arguments(0.0, 60));
    }

    #[test]
    fn arguments_are_range_checked() {
        let base = json!({ "latitude": 37.7749, "longitude": -122.4194 });
        for (field, value) in [
            ("radius_miles", json!(0.05)),
            ("radius_miles", json!(25)),
            ("min_rating", json!(5.5)),
            ("max_results", json!(0)),
            ("max_results", json!(61)),
        ] {
            let mut args = base.clone();
            args[field] = value;
            assert!(parse_arguments(Some(args)).is_err(), "{} accepted", field);
        }

        assert!(parse_arguments(None).is_err());
        assert!(parse_arguments(Some(json!({ "latitude": 37.7749 }))).is_err());
    }

    #[test]
    fn unrated_restaurants_pass_only_without_minimum() {
        let restaurants = vec![
            restaurant("good", Some(4.6), 100.0),
            restaurant("unrated", None, 200.0),
            restaurant("poor", Some(2.1), 300.0),
        ];

        let all: Vec<&str> = select(&restaurants, 0.0, 60)
            .iter()
            .map(|r| r.place_id.as_str())
            .collect();
        assert_eq!(all, vec!["good", "unrated", "poor"]);

        let rated: Vec<&str> = select(&restaurants, 4.0, 60)
            .iter()
            .map(|r| r.place_id.as_str())
            .collect();
        assert_eq!(rated, vec!["good"]);

        assert_eq!(select(&restaurants, 0.0, 2).len(), 2);
    }

    #[test]
    fn formats_restaurant_details() {
        let mut zuni = restaurant("zuni", Some(4.4), 1_609.34);
        zuni.rating_count = Some(2500);
        zuni.price_level = Some(3);

        let text = format_results(&result(vec![zuni], Provenance::Cache), &arguments(0.0, 60));

        assert!(text.starts_with("Found 1 restaurants within 10 miles (source: cache"));
        assert!(text.contains("region:377749:-1224194:16093"));
        assert!(text.contains("1. zuni grill\n"));
        assert!(text.contains("   Distance: 1.00 miles\n"));
        assert!(text.contains("   Rating: 4.4 (2500 reviews)\n"));
        assert!(text.contains("   Price: $$$\n"));
        assert!(text.contains("   Address: Valencia St\n"));
    }

    #[test]
    fn stale_results_are_labelled() {
        let text = format_results(
            &result(vec![restaurant("a", Some(4.0), 10.0)], Provenance::Stale),
            &arguments(0.0, 60),
        );
        assert!(text.contains("stale cache (Google Places unavailable)"));
    }

    #[test]
    fn empty_selection_says_so() {
        let text = format_results(
            &result(vec![restaurant("a", None, 10.0)], Provenance::Fresh),
            &arguments(3.0, 60),
        );
        assert!(text.starts_with("No restaurants found within 10 miles"));
    }

    struct OneRestaurant;

    #[async_trait]
    impl RestaurantSearch for OneRestaurant {
        async fn search(&self, center: Coordinate, _radius: f64) -> Result<Vec<Restaurant>> {
            let mut restaurant = Restaurant::new("zuni", "Zuni Cafe", "1658 Market St", center);
            restaurant.rating = Some(4.4);
            Ok(vec![restaurant])
        }

        async fn details(&self, _place_id: &str) -> Result<Option<Restaurant>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn execute_queries_the_cache() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), None).unwrap());
        let config = CacheConfig {
            background_maintenance: false,
            ..Default::default()
        };
        let orchestrator = CacheOrchestrator::new(store, Arc::new(OneRestaurant), config);
        let tool = FindRestaurantsTool::new(orchestrator);

        let args = json!({ "latitude": 37.7749, "longitude": -122.4194, "radius_miles": 2 });
        let first = tool.execute(Some(args.clone())).await.unwrap();
        let second = tool.execute(Some(args)).await.unwrap();

        let text = |content: &[ToolContent]| match &content[0] {
            ToolContent::Text { text } => text.clone(),
            _ => panic!("expected text content"),
        };
        assert!(text(&first).contains("source: Google Places"));
        assert!(text(&second).contains("source: cache"));
        assert!(text(&second).contains("Zuni Cafe"));
    }

    #[tokio::test]
    async fn execute_rejects_invalid_coordinates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), None).unwrap());
        let orchestrator =
            CacheOrchestrator::new(store, Arc::new(OneRestaurant), CacheConfig::default());
        let tool = FindRestaurantsTool::new(orchestrator);

        let err = tool
            .execute(Some(json!({ "latitude": 123.0, "longitude": 0.0 })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid coordinate"));
    }
}
