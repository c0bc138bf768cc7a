//! Distance/duration matrix for a planning run
//!
//! Asks the maps provider once for all distinct coordinates, caches cells by
//! coordinate pair and fills anything the provider cannot answer with a
//! straight-line estimate. Any estimated cell marks the matrix degraded.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::services::geo::estimate_leg;
use crate::services::maps::MapsProvider;
use crate::types::Coordinates;

/// Coordinates rounded to 1e-6 degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CoordKey(i64, i64);

impl CoordKey {
    fn of(c: &Coordinates) -> Self {
        CoordKey((c.lat * 1e6).round() as i64, (c.lng * 1e6).round() as i64)
    }
}

#[derive(Debug, Clone, Copy)]
struct Leg {
    meters: u64,
    seconds: u64,
    estimated: bool,
}

/// Square travel matrix; index 0 is the start, stops follow in input order
#[derive(Debug, Clone, PartialEq)]
pub struct TravelMatrix {
    meters: Vec<Vec<u64>>,
    seconds: Vec<Vec<u64>>,
    degraded: bool,
}

impl TravelMatrix {
    pub fn from_rows(meters: Vec<Vec<u64>>, seconds: Vec<Vec<u64>>, degraded: bool) -> Self {
        Self { meters, seconds, degraded }
    }

    pub fn size(&self) -> usize {
        self.seconds.len()
    }

    pub fn distance(&self, from: usize, to: usize) -> u64 {
        self.meters[from][to]
    }

    pub fn duration(&self, from: usize, to: usize) -> u64 {
        self.seconds[from][to]
    }

    /// At least one leg is a straight-line estimate
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Builds travel matrices, caching legs for the lifetime of the builder
pub struct MatrixBuilder<'a> {
    maps: &'a dyn MapsProvider,
    cache: HashMap<(CoordKey, CoordKey), Leg>,
}

impl<'a> MatrixBuilder<'a> {
    pub fn new(maps: &'a dyn MapsProvider) -> Self {
        Self {
            maps,
            cache: HashMap::new(),
        }
    }

    pub async fn build(&mut self, locations: &[Coordinates]) -> TravelMatrix {
        let keys: Vec<CoordKey> = locations.iter().map(CoordKey::of).collect();

        // distinct coordinates in first-seen order
        let mut unique: Vec<(CoordKey, Coordinates)> = Vec::new();
        for (key, coords) in keys.iter().zip(locations) {
            if !unique.iter().any(|(k, _)| k == key) {
                unique.push((*key, *coords));
            }
        }

        let missing = unique.iter().any(|(a, _)| {
            unique
                .iter()
                .any(|(b, _)| a != b && !self.cache.contains_key(&(*a, *b)))
        });

        if missing {
            self.fetch(&unique).await;
        }

        let n = locations.len();
        let mut meters = vec![vec![0u64; n]; n];
        let mut seconds = vec![vec![0u64; n]; n];
        let mut degraded = false;

        for i in 0..n {
            for j in 0..n {
                if keys[i] == keys[j] {
                    continue;
                }
                let leg = self
                    .cache
                    .get(&(keys[i], keys[j]))
                    .copied()
                    .unwrap_or_else(|| estimated(&locations[i], &locations[j]));
                meters[i][j] = leg.meters;
                seconds[i][j] = leg.seconds;
                degraded |= leg.estimated;
            }
        }

        TravelMatrix { meters, seconds, degraded }
    }

    async fn fetch(&mut self, unique: &[(CoordKey, Coordinates)]) {
        let coords: Vec<Coordinates> = unique.iter().map(|(_, c)| *c).collect();

        match self.maps.distance_matrix(&coords).await {
            Ok(m) if m.size == coords.len() => {
                let mut gaps = 0usize;
                for (i, (a, ca)) in unique.iter().enumerate() {
                    for (j, (b, cb)) in unique.iter().enumerate() {
                        if i == j {
                            continue;
                        }
                        let leg = if m.is_reachable(i, j) {
                            Leg {
                                meters: m.distance(i, j),
                                seconds: m.duration(i, j),
                                estimated: false,
                            }
                        } else {
                            gaps += 1;
                            estimated(ca, cb)
                        };
                        self.cache.insert((*a, *b), leg);
                    }
                }
                if gaps > 0 {
                    warn!("{} unroutable legs from {}, using straight-line estimates", gaps, self.maps.name());
                }
                debug!("Matrix {}x{} from {}", coords.len(), coords.len(), self.maps.name());
            }
            Ok(m) => {
                warn!(
                    "{} returned a {}x{} matrix for {} locations, using straight-line estimates",
                    self.maps.name(),
                    m.size,
                    m.size,
                    coords.len()
                );
                self.fill_estimates(unique);
            }
            Err(e) => {
                warn!("Maps unavailable ({}), using straight-line estimates", e);
                self.fill_estimates(unique);
            }
        }
    }

    fn fill_estimates(&mut self, unique: &[(CoordKey, Coordinates)]) {
        for (a, ca) in unique {
            for (b, cb) in unique {
                if a != b {
                    self.cache
                        .entry((*a, *b))
                        .or_insert_with(|| estimated(ca, cb));
                }
            }
        }
    }
}

fn estimated(from: &Coordinates, to: &Coordinates) -> Leg {
    let (meters, seconds) = estimate_leg(from, to);
    Leg {
        meters,
        seconds,
        estimated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::maps::testing::ScriptedMaps;
    use std::sync::atomic::Ordering;

    fn points() -> Vec<Coordinates> {
        vec![
            Coordinates { lat: 50.00, lng: 14.00 },
            Coordinates { lat: 50.01, lng: 14.00 },
            Coordinates { lat: 50.02, lng: 14.00 },
        ]
    }

    #[tokio::test]
    async fn test_provider_matrix_used_as_is() {
        let maps = ScriptedMaps::new();
        let mut builder = MatrixBuilder::new(&maps);

        let matrix = builder.build(&points()).await;

        assert!(!matrix.is_degraded());
        assert_eq!(matrix.size(), 3);
        let (straight, _) = estimate_leg(&points()[0], &points()[1]);
        assert_eq!(matrix.distance(0, 1), straight * 12 / 10);
        assert_eq!(matrix.duration(1, 1), 0);
    }

    #[tokio::test]
    async fn test_outage_degrades_to_haversine() {
        let maps = ScriptedMaps::down();
        let mut builder = MatrixBuilder::new(&maps);

        let matrix = builder.build(&points()).await;

        assert!(matrix.is_degraded());
        let (meters, seconds) = estimate_leg(&points()[0], &points()[2]);
        assert_eq!(matrix.distance(0, 2), meters);
        assert_eq!(matrix.duration(0, 2), seconds);
    }

    #[tokio::test]
    async fn test_unreachable_cell_is_estimated() {
        let maps = ScriptedMaps {
            unreachable: vec![(0, 2)],
            ..ScriptedMaps::default()
        };
        let mut builder = MatrixBuilder::new(&maps);

        let matrix = builder.build(&points()).await;

        assert!(matrix.is_degraded());
        let (meters, _) = estimate_leg(&points()[0], &points()[2]);
        assert_eq!(matrix.distance(0, 2), meters);
        assert!(matrix.distance(0, 2) < crate::services::maps::UNREACHABLE);
    }

    #[tokio::test]
    async fn test_duplicate_coordinates_requested_once() {
        let maps = ScriptedMaps::new();
        let mut builder = MatrixBuilder::new(&maps);
        let mut locations = points();
        locations.push(locations[1]);

        let matrix = builder.build(&locations).await;

        assert_eq!(maps.last_request_size.load(Ordering::SeqCst), 3);
        assert_eq!(matrix.size(), 4);
        assert_eq!(matrix.duration(1, 3), 0);
        assert_eq!(matrix.duration(0, 3), matrix.duration(0, 1));
    }

    #[tokio::test]
    async fn test_cache_reused_within_run() {
        let maps = ScriptedMaps::new();
        let mut builder = MatrixBuilder::new(&maps);

        builder.build(&points()).await;
        let subset = vec![points()[2], points()[0]];
        let matrix = builder.build(&subset).await;

        assert_eq!(maps.matrix_calls(), 1);
        assert!(matrix.duration(0, 1) > 0);
    }
}
