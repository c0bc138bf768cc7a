//! Courier worker: route sequencing and call reminders for courier delivery days

pub mod config;
pub mod db;
pub mod defaults;
pub mod error;
pub mod services;
pub mod types;
