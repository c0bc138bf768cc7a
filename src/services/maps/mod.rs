//! Maps collaborator: road distance matrices and geocoding
//!
//! Uses Valhalla for the matrix and Nominatim for geocoding in production.
//! Planning degrades to straight-line estimates when the matrix is unavailable.

mod nominatim;
mod valhalla;

pub use nominatim::{NominatimClient, RateLimiter};
pub use valhalla::{ValhallaClient, ValhallaConfig};

use async_trait::async_trait;
use tracing::debug;

use crate::error::MapsError;
use crate::types::Coordinates;

/// Matrix cell value for a pair the provider could not route
pub const UNREACHABLE: u64 = u64::MAX / 2;

/// Distance and time matrices between locations
#[derive(Debug, Clone)]
pub struct DistanceTimeMatrices {
    /// Distance in meters [i][j] from location i to location j
    pub distances: Vec<Vec<u64>>,
    /// Duration in seconds [i][j] from location i to location j
    pub durations: Vec<Vec<u64>>,
    /// Number of locations
    pub size: usize,
}

impl DistanceTimeMatrices {
    /// Create empty matrices
    pub fn empty() -> Self {
        Self {
            distances: vec![],
            durations: vec![],
            size: 0,
        }
    }

    /// Get distance from location i to location j in meters
    pub fn distance(&self, from: usize, to: usize) -> u64 {
        self.distances[from][to]
    }

    /// Get duration from location i to location j in seconds
    pub fn duration(&self, from: usize, to: usize) -> u64 {
        self.durations[from][to]
    }

    pub fn is_reachable(&self, from: usize, to: usize) -> bool {
        self.distance(from, to) < UNREACHABLE && self.duration(from, to) < UNREACHABLE
    }
}

/// Maps provider trait for abstraction (road network, test doubles)
#[async_trait]
pub trait MapsProvider: Send + Sync {
    /// Distance and time matrices for the given locations, indexed as given
    async fn distance_matrix(&self, locations: &[Coordinates]) -> Result<DistanceTimeMatrices, MapsError>;

    /// Resolve a free-form address
    async fn geocode(&self, address: &str) -> Result<Coordinates, MapsError>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Production provider: Valhalla matrix (optional) plus Nominatim geocoding
pub struct RoadMaps {
    valhalla: Option<ValhallaClient>,
    nominatim: NominatimClient,
}

impl RoadMaps {
    pub fn new(valhalla: Option<ValhallaClient>, nominatim: NominatimClient) -> Self {
        Self { valhalla, nominatim }
    }
}

#[async_trait]
impl MapsProvider for RoadMaps {
    async fn distance_matrix(&self, locations: &[Coordinates]) -> Result<DistanceTimeMatrices, MapsError> {
        match &self.valhalla {
            Some(client) => client
                .matrix(locations)
                .await
                .map_err(|e| MapsError::Unavailable(format!("{:#}", e))),
            None => {
                debug!("No routing engine configured");
                Err(MapsError::Unavailable("no routing engine configured".to_string()))
            }
        }
    }

    async fn geocode(&self, address: &str) -> Result<Coordinates, MapsError> {
        match self.nominatim.search(address).await {
            Ok(Some(coords)) => Ok(coords),
            Ok(None) => Err(MapsError::GeocodeFailed {
                address: address.to_string(),
            }),
            Err(e) => Err(MapsError::Unavailable(format!("{:#}", e))),
        }
    }

    fn name(&self) -> &str {
        match self.valhalla {
            Some(_) => "Valhalla+Nominatim",
            None => "Nominatim",
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted maps provider for tests

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::services::geo::estimate_leg;

    /// Straight-line matrix with optional outage, unreachable pairs and a geocode table
    #[derive(Default)]
    pub struct ScriptedMaps {
        pub matrix_down: bool,
        /// Pairs (by request index) reported as unreachable
        pub unreachable: Vec<(usize, usize)>,
        pub addresses: HashMap<String, Coordinates>,
        pub matrix_calls: AtomicUsize,
        pub geocode_calls: AtomicUsize,
        pub last_request_size: AtomicUsize,
    }

    impl ScriptedMaps {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn down() -> Self {
            Self {
                matrix_down: true,
                ..Self::default()
            }
        }

        pub fn with_address(mut self, address: &str, lat: f64, lng: f64) -> Self {
            self.addresses.insert(address.to_string(), Coordinates { lat, lng });
            self
        }

        pub fn matrix_calls(&self) -> usize {
            self.matrix_calls.load(Ordering::SeqCst)
        }

        pub fn geocode_calls(&self) -> usize {
            self.geocode_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MapsProvider for ScriptedMaps {
        async fn distance_matrix(&self, locations: &[Coordinates]) -> Result<DistanceTimeMatrices, MapsError> {
            self.matrix_calls.fetch_add(1, Ordering::SeqCst);
            self.last_request_size.store(locations.len(), Ordering::SeqCst);
            if self.matrix_down {
                return Err(MapsError::Unavailable("scripted outage".to_string()));
            }
            let n = locations.len();
            let mut distances = vec![vec![0u64; n]; n];
            let mut durations = vec![vec![0u64; n]; n];
            for i in 0..n {
                for j in 0..n {
                    let (meters, seconds) = estimate_leg(&locations[i], &locations[j]);
                    // road legs a bit longer than the straight line
                    distances[i][j] = meters * 12 / 10;
                    durations[i][j] = seconds * 12 / 10;
                }
            }
            for &(i, j) in &self.unreachable {
                distances[i][j] = UNREACHABLE;
                durations[i][j] = UNREACHABLE;
            }
            Ok(DistanceTimeMatrices { distances, durations, size: n })
        }

        async fn geocode(&self, address: &str) -> Result<Coordinates, MapsError> {
            self.geocode_calls.fetch_add(1, Ordering::SeqCst);
            self.addresses
                .get(address)
                .copied()
                .ok_or_else(|| MapsError::GeocodeFailed {
                    address: address.to_string(),
                })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
