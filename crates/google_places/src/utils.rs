use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use futures::lock::Mutex;
use futures_timer::Delay;
use http_client::{HttpClient, Request, RequestBuilderExt, ResponseAsyncBodyExt};
use serde_json::Value;

pub struct RateLimiter {
    last_call_time: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            last_call_time: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    pub async fn acquire(&self, endpoint: &str) -> Result<()> {
        let mut last_call_map = self.last_call_time.lock().await;

        if let Some(last_call) = last_call_map.get(endpoint) {
            let elapsed = last_call.elapsed();
            if elapsed < self.min_interval {
                Delay::new(self.min_interval - elapsed).await;
            }
        }

        last_call_map.insert(endpoint.to_string(), Instant::now());
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn make_request(
    http_client: &Arc<dyn HttpClient>,
    rate_limiter: &RateLimiter,
    base_url: &str,
    endpoint: &str,
    params: &Value,
) -> Result<Value> {
    rate_limiter.acquire(endpoint).await?;

    let url = format!("{}{}?{}", base_url, endpoint, build_query_string(params));

    let request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Accept", "application/json")
        .end()?;

    let response = http_client.send(request).await?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status == 429 {
            return Err(anyhow!("Places rate limit exceeded"));
        }

        return Err(anyhow!("HTTP error {}: {}", status, error_body));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow!("Failed to parse JSON response: {}", e))?;
    Ok(body)
}

pub fn build_query_string(params: &Value) -> String {
    let mut query_parts = Vec::new();

    if let Some(obj) = params.as_object() {
        for (key, value) in obj {
            match value {
                Value::String(s) => {
                    query_parts.push(format!("{}={}", key, urlencoding::encode(s)));
                }
                Value::Number(n) => {
                    query_parts.push(format!("{}={}", key, n));
                }
                Value::Bool(b) => {
                    query_parts.push(format!("{}={}", key, b));
                }
                _ => {}
            }
        }
    }

    query_parts.join("&")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_string_encodes_values_and_skips_null() {
        let params = json!({
            "location": "37.7749,-122.4194",
            "radius": 16093,
            "pagetoken": null,
        });

        let query = build_query_string(&params);
        assert!(query.contains("location=37.7749%2C-122.4194"));
        assert!(query.contains("radius=16093"));
        assert!(!query.contains("pagetoken"));
    }

    #[tokio::test]
    async fn rate_limiter_spaces_calls_per_endpoint() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(50));
        let start = Instant::now();

        limiter.acquire("/nearbysearch/json").await.unwrap();
        limiter.acquire("/details/json").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));

        limiter.acquire("/nearbysearch/json").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
