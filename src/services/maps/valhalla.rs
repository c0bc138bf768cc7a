//! Valhalla routing engine client
//!
//! Valhalla API documentation:
//! https://valhalla.github.io/valhalla/api/matrix/api-reference/

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DistanceTimeMatrices, UNREACHABLE};
use crate::types::Coordinates;

/// Valhalla client configuration
#[derive(Debug, Clone)]
pub struct ValhallaConfig {
    /// Base URL of Valhalla server (e.g., "http://localhost:8002")
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for ValhallaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl ValhallaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }
}

/// Valhalla routing client
pub struct ValhallaClient {
    client: Client,
    config: ValhallaConfig,
}

impl ValhallaClient {
    pub fn new(config: ValhallaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    /// Build the sources_to_targets request
    fn build_matrix_request(&self, locations: &[Coordinates]) -> MatrixRequest {
        let locs: Vec<ValhallaLocation> = locations
            .iter()
            .map(|c| ValhallaLocation {
                lat: c.lat,
                lon: c.lng,
                // geocoded house points are often off the road edge
                radius: Some(500),
            })
            .collect();

        MatrixRequest {
            sources: locs.clone(),
            targets: locs,
            costing: "auto".to_string(),
            units: "kilometers".to_string(),
        }
    }

    /// Distance (m) and duration (s) matrices; cells Valhalla cannot route are `UNREACHABLE`
    pub async fn matrix(&self, locations: &[Coordinates]) -> Result<DistanceTimeMatrices> {
        let n = locations.len();

        if n == 0 {
            return Ok(DistanceTimeMatrices::empty());
        }

        if n == 1 {
            return Ok(DistanceTimeMatrices {
                distances: vec![vec![0]],
                durations: vec![vec![0]],
                size: 1,
            });
        }

        let request = self.build_matrix_request(locations);
        let url = format!("{}/sources_to_targets", self.config.base_url);

        debug!("Requesting distance matrix from Valhalla for {} locations", n);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Valhalla")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Valhalla returned error {}: {}", status, body);
        }

        let matrix_response: MatrixResponse = response
            .json()
            .await
            .context("Failed to parse Valhalla response")?;

        let matrices = convert_matrix(&matrix_response, n)?;
        debug!("Received distance matrix from Valhalla: {}x{}", n, n);
        Ok(matrices)
    }
}

fn convert_matrix(response: &MatrixResponse, n: usize) -> Result<DistanceTimeMatrices> {
    if response.sources_to_targets.len() != n
        || response.sources_to_targets.iter().any(|row| row.len() != n)
    {
        anyhow::bail!("Valhalla matrix has unexpected shape (expected {}x{})", n, n);
    }

    let mut distances = vec![vec![0u64; n]; n];
    let mut durations = vec![vec![0u64; n]; n];

    for (i, row) in response.sources_to_targets.iter().enumerate() {
        for (j, cell) in row.iter().enumerate() {
            match (cell.distance, cell.time) {
                (Some(km), Some(seconds)) => {
                    distances[i][j] = (km * 1000.0).round() as u64;
                    durations[i][j] = seconds.round() as u64;
                }
                _ => {
                    warn!("No route for {} -> {}", i, j);
                    distances[i][j] = UNREACHABLE;
                    durations[i][j] = UNREACHABLE;
                }
            }
        }
    }

    Ok(DistanceTimeMatrices {
        distances,
        durations,
        size: n,
    })
}

// Valhalla API types

#[derive(Debug, Serialize)]
struct MatrixRequest {
    sources: Vec<ValhallaLocation>,
    targets: Vec<ValhallaLocation>,
    costing: String,
    units: String,
}

#[derive(Debug, Clone, Serialize)]
struct ValhallaLocation {
    lat: f64,
    lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    radius: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    sources_to_targets: Vec<Vec<MatrixCell>>,
}

#[derive(Debug, Deserialize)]
struct MatrixCell {
    /// Distance in kilometers
    distance: Option<f64>,
    /// Time in seconds
    time: Option<f64>,
}
