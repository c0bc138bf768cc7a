//! Sequencing solver configuration

use crate::config::PlanningConfig;
use crate::services::constraints::CostWeights;

/// Configuration for the sequencing solver
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Budget for the primary solver; the fallback runs once it is spent
    pub timeout_ms: u64,
    /// Maximum improvement passes over the whole sequence
    pub max_passes: usize,
    /// Longest run of consecutive stops relocated by or-opt
    pub max_segment_len: usize,
    pub weights: CostWeights,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: crate::defaults::DEFAULT_SOLVER_TIMEOUT_MS,
            max_passes: 100,
            max_segment_len: 3,
            weights: CostWeights::default(),
        }
    }
}

impl SolverConfig {
    /// Create config with a custom time budget
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            ..Default::default()
        }
    }

    pub fn from_planning(planning: &PlanningConfig) -> Self {
        Self::new(planning.solver_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SolverConfig::default();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.max_segment_len, 3);
        assert_eq!(config.weights.violation_penalty, 10_000);
    }

    #[test]
    fn test_custom_config() {
        let config = SolverConfig::new(250);
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.max_passes, SolverConfig::default().max_passes);
    }

    #[test]
    fn test_from_planning() {
        let planning = PlanningConfig {
            solver_timeout_ms: 0,
            ..PlanningConfig::default()
        };
        assert_eq!(SolverConfig::from_planning(&planning).timeout_ms, 0);
    }
}
