//! Business logic services

pub mod assembly;
pub mod call_actions;
pub mod call_schedule;
pub mod call_scheduler;
pub mod call_state;
pub mod constraints;
pub mod geo;
pub mod maps;
pub mod matrix;
pub mod merge;
pub mod notifier;
pub mod planner;
pub mod sequencing;
pub mod single_flight;
