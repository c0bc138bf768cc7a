//! Route optimization for one courier day
//!
//! Loads the day, resolves missing coordinates, builds the travel matrix and
//! constraint model, sequences, assembles the route, merges call statuses and
//! persists everything in one commit at the end. Any failure before the
//! commit leaves the day untouched; geocoding results go to the shared
//! address cache as soon as they arrive.
//!
//! Runs for the same courier day are serialized through a lease taken from
//! the repository, so separate processes sharing a database exclude each
//! other too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{PlanningConfig, SingleFlightPolicy};
use crate::db::{geocode_key, PlanCommit, Repository};
use crate::error::PlanningError;
use crate::services::assembly::assemble;
use crate::services::constraints::ConstraintModel;
use crate::services::maps::MapsProvider;
use crate::services::matrix::MatrixBuilder;
use crate::services::merge::merge_call_statuses;
use crate::services::sequencing::{sequence_blocking, SolverConfig};
use crate::types::{CallStatus, Coordinates, CourierDay, OptimizedRoute, RunDiagnostics, StartLocation, Stop};

/// Per-run switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Sequence as if no stop had a manual arrival time. Stored pins and
    /// manual schedule values are left as they are.
    pub ignore_manual_arrivals: bool,
}

/// Result of a successful optimization run
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub route: OptimizedRoute,
    /// All call statuses of the day after the merge, ordered by call time
    pub call_statuses: Vec<CallStatus>,
    pub diagnostics: RunDiagnostics,
}

pub struct RoutePlanner {
    repo: Arc<dyn Repository>,
    maps: Arc<dyn MapsProvider>,
    config: PlanningConfig,
    policy: SingleFlightPolicy,
}

impl RoutePlanner {
    pub fn new(
        repo: Arc<dyn Repository>,
        maps: Arc<dyn MapsProvider>,
        config: PlanningConfig,
        policy: SingleFlightPolicy,
    ) -> Self {
        Self {
            repo,
            maps,
            config,
            policy,
        }
    }

    pub async fn optimize(&self, day: CourierDay) -> Result<PlanOutcome, PlanningError> {
        self.optimize_with(day, OptimizeOptions::default()).await
    }

    pub async fn optimize_with(&self, day: CourierDay, options: OptimizeOptions) -> Result<PlanOutcome, PlanningError> {
        let _lease = self
            .repo
            .lock_day(day, self.policy)
            .await?
            .ok_or(PlanningError::ConcurrentOptimizationInProgress { day })?;
        let started = Instant::now();
        info!("Optimizing route for {} via {}", day, self.maps.name());

        let stops: Vec<Stop> = self
            .repo
            .load_stops(day)
            .await?
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        let start = self
            .repo
            .load_start_location(day)
            .await?
            .ok_or(PlanningError::NoStartLocation { day })?;
        let start_time = start.effective_start(day.date, self.config.default_start_time);

        let (start_coords, geocoded_start) = self.resolve_start(day, &start).await?;
        let (stops, geocoded_stops) = self.resolve_stops(stops).await?;

        let mut locations = Vec::with_capacity(stops.len() + 1);
        locations.push(start_coords);
        locations.extend(stops.iter().filter_map(|s| s.coordinates));

        let matrix = MatrixBuilder::new(self.maps.as_ref()).build(&locations).await;
        if matrix.is_degraded() {
            warn!("Travel matrix for {} uses straight-line estimates", day);
        }

        // merge below still sees the pins, so manual values survive
        let planned: Vec<Stop> = if options.ignore_manual_arrivals {
            info!("Ignoring manual arrival times for this run of {}", day);
            stops
                .iter()
                .cloned()
                .map(|mut stop| {
                    stop.pins.arrival = None;
                    stop
                })
                .collect()
        } else {
            stops.clone()
        };

        let model = Arc::new(ConstraintModel::build(&planned, start_time, &self.config));
        let matrix = Arc::new(matrix);
        let outcome = sequence_blocking(
            Arc::clone(&model),
            Arc::clone(&matrix),
            SolverConfig::from_planning(&self.config),
        )
        .await;

        let assembled = assemble(&model, &matrix, &planned, &outcome.order);
        for violation in &assembled.violations {
            warn!(
                "Stop {} arrives {} min after its {}window",
                violation.stop_id,
                violation.lateness_minutes,
                if violation.pinned { "pinned " } else { "" }
            );
        }

        let existing = self.repo.load_call_statuses(day).await?;
        let merged = merge_call_statuses(day, &assembled.route, &stops, &existing, &self.config, Utc::now());

        let commit = PlanCommit {
            day,
            route: assembled.route,
            call_writes: merged.writes,
            geocoded_stops,
            geocoded_start,
        };
        self.repo.save_plan(&commit).await?;

        let diagnostics = RunDiagnostics {
            algorithm: outcome.algorithm,
            fallback_reason: outcome.fallback_reason,
            degraded_matrix: matrix.is_degraded(),
            window_violations: assembled.violations,
            solve_time_ms: outcome.solve_time_ms,
            solver_log: outcome.solver_log,
            manual_arrivals_ignored: options.ignore_manual_arrivals,
        };

        info!(
            "Route for {} saved: {} stops, {} m, {:?}{} in {} ms",
            day,
            commit.route.points.len(),
            commit.route.total_distance_meters,
            diagnostics.algorithm,
            diagnostics
                .fallback_reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default(),
            started.elapsed().as_millis()
        );

        Ok(PlanOutcome {
            call_statuses: overlay(existing, merged.changed),
            route: commit.route,
            diagnostics,
        })
    }

    async fn resolve_start(
        &self,
        day: CourierDay,
        start: &StartLocation,
    ) -> Result<(Coordinates, Option<Coordinates>), PlanningError> {
        if let Some(coords) = start.coordinates {
            return Ok((coords, None));
        }
        let Some(address) = start.address.as_deref() else {
            return Err(PlanningError::NoStartLocation { day });
        };
        let key = geocode_key(address);
        if let Some(coords) = self.repo.load_geocode(&key).await? {
            debug!("Start of {} found in geocode cache", day);
            return Ok((coords, Some(coords)));
        }
        match self.maps.geocode(address).await {
            Ok(coords) => {
                debug!("Geocoded start of {}: {:?}", day, coords);
                self.remember(&key, coords).await;
                Ok((coords, Some(coords)))
            }
            Err(e) => {
                warn!("Start location of {} not resolved: {}", day, e);
                Err(PlanningError::UnresolvedAddress {
                    subject: "start location".to_string(),
                    address: address.to_string(),
                })
            }
        }
    }

    /// Fill in missing coordinates from the cache, then the maps provider.
    /// Each distinct address is looked up once. Fails on the first
    /// unresolved stop in input order.
    async fn resolve_stops(
        &self,
        mut stops: Vec<Stop>,
    ) -> Result<(Vec<Stop>, Vec<(String, Coordinates)>), PlanningError> {
        let pending: Vec<usize> = (0..stops.len()).filter(|&i| stops[i].coordinates.is_none()).collect();
        if pending.is_empty() {
            return Ok((stops, Vec::new()));
        }

        let mut resolved: HashMap<String, Coordinates> = HashMap::new();
        // key and the first stop carrying it
        let mut misses: Vec<(String, usize)> = Vec::new();
        for &i in &pending {
            let key = geocode_key(&stops[i].address);
            if resolved.contains_key(&key) || misses.iter().any(|(k, _)| *k == key) {
                continue;
            }
            match self.repo.load_geocode(&key).await? {
                Some(coords) => {
                    resolved.insert(key, coords);
                }
                None => misses.push((key, i)),
            }
        }
        info!(
            "Geocoding {} stops: {} cached, {} to look up",
            pending.len(),
            resolved.len(),
            misses.len()
        );

        let lookups = misses.iter().map(|(_, i)| self.maps.geocode(&stops[*i].address));
        let results = join_all(lookups).await;
        for ((key, i), result) in misses.into_iter().zip(results) {
            match result {
                Ok(coords) => {
                    self.remember(&key, coords).await;
                    resolved.insert(key, coords);
                }
                Err(e) => warn!("Stop {} not resolved: {}", stops[i].id, e),
            }
        }

        let mut geocoded = Vec::with_capacity(pending.len());
        for &i in &pending {
            let stop = &mut stops[i];
            let Some(&coords) = resolved.get(&geocode_key(&stop.address)) else {
                return Err(PlanningError::UnresolvedAddress {
                    subject: format!("stop {}", stop.id),
                    address: stop.address.clone(),
                });
            };
            stop.coordinates = Some(coords);
            geocoded.push((stop.id.clone(), coords));
        }

        Ok((stops, geocoded))
    }

    /// Cache a geocoding result; a failed write only costs a repeat lookup
    async fn remember(&self, key: &str, coords: Coordinates) {
        if let Err(e) = self.repo.save_geocode(key, coords).await {
            warn!("Geocode cache write for '{}' failed: {}", key, e);
        }
    }
}

fn overlay(existing: Vec<CallStatus>, changed: Vec<CallStatus>) -> Vec<CallStatus> {
    let mut by_stop: HashMap<String, CallStatus> =
        existing.into_iter().map(|s| (s.stop_id.clone(), s)).collect();
    for status in changed {
        by_stop.insert(status.stop_id.clone(), status);
    }
    let mut all: Vec<CallStatus> = by_stop.into_values().collect();
    all.sort_by(|a, b| {
        a.schedule
            .call_time()
            .cmp(&b.schedule.call_time())
            .then_with(|| a.stop_id.cmp(&b.stop_id))
    });
    all
}
