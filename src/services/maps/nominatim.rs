//! Nominatim geocoding client

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::Coordinates;

/// Public Nominatim allows one request per second
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Nominatim API response
#[derive(Debug, Deserialize)]
struct NominatimResult {
    lat: String,
    lon: String,
    display_name: String,
}

/// Nominatim geocoding client
pub struct NominatimClient {
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl NominatimClient {
    /// Create a new client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("courier-worker/0.1")
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            limiter: RateLimiter::new(MIN_REQUEST_INTERVAL),
        })
    }

    fn search_url(&self, address: &str) -> String {
        format!(
            "{}/search?q={}&format=json&limit=1",
            self.base_url,
            urlencoding::encode(address)
        )
    }

    /// Geocode a free-form address. `Ok(None)` when nothing matches.
    pub async fn search(&self, address: &str) -> Result<Option<Coordinates>> {
        self.limiter.wait().await;

        let response = self
            .client
            .get(self.search_url(address))
            .send()
            .await
            .context("Failed to send geocoding request")?;

        if !response.status().is_success() {
            anyhow::bail!("Nominatim returned error {}", response.status());
        }

        let results: Vec<NominatimResult> = response
            .json()
            .await
            .context("Failed to parse geocoding response")?;

        parse_first(&results)
    }
}

fn parse_first(results: &[NominatimResult]) -> Result<Option<Coordinates>> {
    let Some(result) = results.first() else {
        return Ok(None);
    };
    let lat: f64 = result.lat.parse().context("Invalid latitude")?;
    let lng: f64 = result.lon.parse().context("Invalid longitude")?;
    debug!("Geocoded to {}", result.display_name);
    Ok(Some(Coordinates { lat, lng }))
}

/// Rate limiter that enforces minimum interval between calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait until it's safe to make another call
    pub async fn wait(&self) {
        // holding the lock across the sleep serializes callers
        let mut last = self.last_call.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url_encodes_address() {
        let client = NominatimClient::new("https://nominatim.example.org/").unwrap();
        assert_eq!(
            client.search_url("Main St 1, Springfield"),
            "https://nominatim.example.org/search?q=Main%20St%201%2C%20Springfield&format=json&limit=1"
        );
    }

    #[test]
    fn test_parse_first_result() {
        let results: Vec<NominatimResult> = serde_json::from_str(
            r#"[{"lat": "50.0810", "lon": "14.4280", "display_name": "Wenceslas Square"}]"#,
        )
        .unwrap();
        let coords = parse_first(&results).unwrap().unwrap();
        assert!((coords.lat - 50.081).abs() < 1e-9);
        assert!((coords.lng - 14.428).abs() < 1e-9);
    }

    #[test]
    fn test_parse_no_results() {
        assert!(parse_first(&[]).unwrap().is_none());
    }

    #[test]
    fn test_parse_bad_latitude() {
        let results = vec![NominatimResult {
            lat: "north".to_string(),
            lon: "14.0".to_string(),
            display_name: String::new(),
        }];
        assert!(parse_first(&results).is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(50));

        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
