mod utils;

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cache::{Coordinate, Restaurant};
use futures_timer::Delay;
use http_client::HttpClient;
use search::RestaurantSearch;
use serde_json::{Value, json};

pub use crate::utils::RateLimiter;

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";
const NEARBY_SEARCH: &str = "/nearbysearch/json";
const PLACE_DETAILS: &str = "/details/json";
// Nearby Search never returns contact fields; Place Details is asked for them.
const DETAIL_FIELDS: &str = "place_id,name,vicinity,formatted_address,geometry,rating,\
user_ratings_total,price_level,types,photos,formatted_phone_number,website";
const MAX_PAGES: usize = 3;
const MAX_PHOTOS: usize = 3;
// Google rejects a next_page_token that is used immediately after issue.
const PAGE_TOKEN_DELAY: Duration = Duration::from_secs(2);

pub struct GooglePlaces {
    http_client: Arc<dyn HttpClient>,
    rate_limiter: Arc<RateLimiter>,
    api_key: String,
    base_url: String,
    page_token_delay: Duration,
}

#[derive(Default)]
pub struct GooglePlacesBuilder {
    http_client: Option<Arc<dyn HttpClient>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    api_key: Option<String>,
    base_url: Option<String>,
    page_token_delay: Option<Duration>,
}

impl GooglePlaces {
    pub fn builder() -> GooglePlacesBuilder {
        GooglePlacesBuilder::default()
    }

    async fn fetch_page(&self, params: &Value) -> Result<(Vec<Restaurant>, Option<String>)> {
        let body = utils::make_request(
            &self.http_client,
            &self.rate_limiter,
            &self.base_url,
            NEARBY_SEARCH,
            params,
        )
        .await?;
        parse_page(&body)
    }
}

impl GooglePlacesBuilder {
    pub fn with_http_client(&mut self, http_client: Arc<dyn HttpClient>) -> &mut Self {
        self.http_client = Some(http_client);
        self
    }

    pub fn with_rate_limiter(&mut self, rate_limiter: Arc<RateLimiter>) -> &mut Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_api_key<S: Into<String>>(&mut self, api_key: S) -> &mut Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url<S: Into<String>>(&mut self, base_url: S) -> &mut Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_page_token_delay(&mut self, delay: Duration) -> &mut Self {
        self.page_token_delay = Some(delay);
        self
    }

    pub fn build(&self) -> Result<GooglePlaces> {
        let http_client = self
            .http_client
            .clone()
            .ok_or_else(|| anyhow!("http client is required"))?;
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("Google Places API key is required"))?;

        Ok(GooglePlaces {
            http_client,
            rate_limiter: self.rate_limiter.clone().unwrap_or_default(),
            api_key,
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            page_token_delay: self.page_token_delay.unwrap_or(PAGE_TOKEN_DELAY),
        })
    }
}

#[async_trait]
impl RestaurantSearch for GooglePlaces {
    async fn search(&self, center: Coordinate, radius_meters: f64) -> Result<Vec<Restaurant>> {
        log::debug!(
            "Nearby search at {},{} within {}m",
            center.latitude,
            center.longitude,
            radius_meters
        );

        let params = json!({
            "location": format!("{},{}", center.latitude, center.longitude),
            "radius": radius_meters.round() as i64,
            "type": "restaurant",
            "key": self.api_key,
        });

        let (mut restaurants, mut next_page_token) = self.fetch_page(&params).await?;

        let mut pages = 1;
        while let Some(token) = next_page_token.take() {
            if pages >= MAX_PAGES {
                break;
            }
            Delay::new(self.page_token_delay).await;

            let params = json!({
                "pagetoken": token,
                "key": self.api_key,
            });
            // A failed follow-up page keeps what was already collected.
            match self.fetch_page(&params).await {
                Ok((page, token)) => {
                    restaurants.extend(page);
                    next_page_token = token;
                    pages += 1;
                }
                Err(err) => {
                    log::warn!("Stopping pagination after page {}: {}", pages, err);
                    break;
                }
            }
        }

        log::debug!("Nearby search returned {} restaurants", restaurants.len());
        Ok(restaurants)
    }

    async fn details(&self, place_id: &str) -> Result<Option<Restaurant>> {
        log::debug!("Place details for {}", place_id);

        let params = json!({
            "place_id": place_id,
            "fields": DETAIL_FIELDS,
            "key": self.api_key,
        });

        let body = utils::make_request(
            &self.http_client,
            &self.rate_limiter,
            &self.base_url,
            PLACE_DETAILS,
            &params,
        )
        .await?;
        parse_details(&body)
    }
}

fn parse_details(body: &Value) -> Result<Option<Restaurant>> {
    let status = body
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("UNKNOWN");

    match status {
        "OK" => {}
        "NOT_FOUND" | "ZERO_RESULTS" => return Ok(None),
        other => {
            let message = body
                .get("error_message")
                .and_then(|m| m.as_str())
                .unwrap_or("no error message");
            return Err(anyhow!("Places API error {}: {}", other, message));
        }
    }

    body.get("result")
        .and_then(parse_place)
        .map(Some)
        .ok_or_else(|| anyhow!("Place details response has no usable result"))
}

fn parse_page(body: &Value) -> Result<(Vec<Restaurant>, Option<String>)> {
    let status = body
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("UNKNOWN");

    match status {
        "OK" => {}
        "ZERO_RESULTS" => return Ok((Vec::new(), None)),
        other => {
            let message = body
                .get("error_message")
                .and_then(|m| m.as_str())
                .unwrap_or("no error message");
            return Err(anyhow!("Places API error {}: {}", other, message));
        }
    }

    let restaurants: Vec<Restaurant> = body
        .get("results")
        .and_then(|r| r.as_array())
        .map(|results| results.iter().filter_map(parse_place).collect())
        .unwrap_or_default();

    let next_page_token = body
        .get("next_page_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    Ok((restaurants, next_page_token))
}

fn parse_place(place: &Value) -> Option<Restaurant> {
    let place_id = place.get("place_id").and_then(|p| p.as_str())?;
    let location = place.get("geometry").and_then(|g| g.get("location"))?;
    let coordinate = Coordinate::new(
        location.get("lat").and_then(|l| l.as_f64())?,
        location.get("lng").and_then(|l| l.as_f64())?,
    );

    let mut restaurant = Restaurant::new(
        place_id,
        place
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("Unknown"),
        place
            .get("vicinity")
            .or_else(|| place.get("formatted_address"))
            .and_then(|v| v.as_str())
            .unwrap_or("Address not available"),
        coordinate,
    );

    restaurant.rating = place.get("rating").and_then(|r| r.as_f64());
    restaurant.rating_count = place
        .get("user_ratings_total")
        .and_then(|r| r.as_u64())
        .map(|r| r as u32);
    restaurant.price_level = place
        .get("price_level")
        .and_then(|p| p.as_u64())
        .filter(|p| *p <= 4)
        .map(|p| p as u8);

    if let Some(types) = place.get("types").and_then(|t| t.as_array()) {
        restaurant.cuisine_tags = types
            .iter()
            .filter_map(|t| t.as_str())
            .map(str::to_string)
            .collect();
    }

    if let Some(photos) = place.get("photos").and_then(|p| p.as_array()) {
        restaurant.photo_refs = photos
            .iter()
            .filter_map(|photo| photo.get("photo_reference").and_then(|r| r.as_str()))
            .take(MAX_PHOTOS)
            .map(str::to_string)
            .collect();
    }

    restaurant.phone = place
        .get("formatted_phone_number")
        .and_then(|p| p.as_str())
        .map(str::to_string);
    restaurant.website = place
        .get("website")
        .and_then(|w| w.as_str())
        .map(str::to_string);

    Some(restaurant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nearby_search_page() {
        let body = json!({
            "status": "OK",
            "next_page_token": "token-2",
            "results": [
                {
                    "place_id": "ChIJ1",
                    "name": "Zuni Cafe",
                    "vicinity": "1658 Market St",
                    "geometry": { "location": { "lat": 37.7735, "lng": -122.4216 } },
                    "rating": 4.4,
                    "user_ratings_total": 2500,
                    "price_level": 3,
                    "types": ["restaurant", "food"],
                    "photos": [
                        { "photo_reference": "p1" },
                        { "photo_reference": "p2" },
                        { "photo_reference": "p3" },
                        { "photo_reference": "p4" }
                    ]
                },
                { "name": "No id" }
            ]
        });

        let (restaurants, token) = parse_page(&body).unwrap();
        assert_eq!(token.as_deref(), Some("token-2"));
        assert_eq!(restaurants.len(), 1);

        let zuni = &restaurants[0];
        assert_eq!(zuni.place_id, "ChIJ1");
        assert_eq!(zuni.name, "Zuni Cafe");
        assert_eq!(zuni.address, "1658 Market St");
        assert_eq!(zuni.coordinate, Coordinate::new(37.7735, -122.4216));
        assert_eq!(zuni.rating, Some(4.4));
        assert_eq!(zuni.rating_count, Some(2500));
        assert_eq!(zuni.price_level, Some(3));
        assert_eq!(zuni.cuisine_tags, vec!["restaurant", "food"]);
        assert_eq!(zuni.photo_refs, vec!["p1", "p2", "p3"]);
        assert_eq!(zuni.touch_count, 0);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let restaurant = parse_place(&json!({
            "place_id": "x",
            "geometry": { "location": { "lat": 1.0, "lng": 2.0 } }
        }))
        .unwrap();
        assert_eq!(restaurant.name, "Unknown");
        assert_eq!(restaurant.address, "Address not available");
        assert_eq!(restaurant.rating, None);
        assert!(restaurant.photo_refs.is_empty());
    }

    #[test]
    fn places_without_location_are_skipped() {
        assert!(parse_place(&json!({ "place_id": "x" })).is_none());
        assert!(
            parse_place(&json!({
                "place_id": "x",
                "geometry": { "location": { "lat": 37.77 } }
            }))
            .is_none()
        );
    }

    #[test]
    fn parses_place_details_contact_fields() {
        let body = json!({
            "status": "OK",
            "result": {
                "place_id": "ChIJ1",
                "name": "Zuni Cafe",
                "formatted_address": "1658 Market St, San Francisco, CA 94102, USA",
                "geometry": { "location": { "lat": 37.7735, "lng": -122.4216 } },
                "formatted_phone_number": "(415) 552-2522",
                "website": "https://zunicafe.com/"
            }
        });

        let zuni = parse_details(&body).unwrap().unwrap();
        assert_eq!(zuni.place_id, "ChIJ1");
        assert_eq!(zuni.address, "1658 Market St, San Francisco, CA 94102, USA");
        assert_eq!(zuni.phone.as_deref(), Some("(415) 552-2522"));
        assert_eq!(zuni.website.as_deref(), Some("https://zunicafe.com/"));
    }

    #[test]
    fn unknown_place_details_is_none() {
        assert!(
            parse_details(&json!({ "status": "NOT_FOUND" }))
                .unwrap()
                .is_none()
        );
        assert!(parse_details(&json!({ "status": "OVER_QUERY_LIMIT" })).is_err());
    }

    #[test]
    fn zero_results_is_empty_not_error() {
        let (restaurants, token) = parse_page(&json!({ "status": "ZERO_RESULTS" })).unwrap();
        assert!(restaurants.is_empty());
        assert!(token.is_none());
    }

    #[test]
    fn error_status_is_reported() {
        let err = parse_page(&json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        }))
        .unwrap_err();
        assert!(err.to_string().contains("REQUEST_DENIED"));
    }
}
