//! CLI argument parsing for the courier-worker binary.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "courier-worker", about = "Courier route sequencing and call-reminder worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the call scheduler until Ctrl-C (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Optimize one courier day and print the route as JSON
    Optimize {
        /// Courier id
        #[arg(long)]
        courier: Uuid,
        /// Planning day, YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
        /// Sequence this run without the stops' manual arrival times
        #[arg(long)]
        ignore_manual_times: bool,
    },
}
