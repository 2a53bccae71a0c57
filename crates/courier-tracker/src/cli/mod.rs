//! Command-line interface for courier-tracker.
//!
//! This module provides the CLI structure for the `couriertrack` binary and
//! the plain-text rendering shared by its commands.

mod commands;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, RunCommand, StatusCommand};

use crate::config::Config;
use crate::logging::Verbosity;
use crate::storage::TrackingSnapshot;

/// couriertrack - Courier location tracking with durable resume
///
/// Streams a courier's position to the tracking server while a delivery is
/// in transit, and resumes tracking after restarts and network loss.
#[derive(Debug, Parser)]
#[command(name = "couriertrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tracker until interrupted
    Run(RunCommand),

    /// Show persisted tracking state
    Status(StatusCommand),

    /// Clear persisted tracking state
    Stop,

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

/// Render persisted tracking state for humans.
#[must_use]
pub fn render_status(snapshot: &TrackingSnapshot, database: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "couriertrack status");
    let _ = writeln!(out, "------------------");
    let _ = writeln!(out, "Database:   {}", database.display());
    match &snapshot.record {
        Some(record) => {
            let _ = writeln!(out, "Delivery:   {}", record.delivery_id);
            let _ = writeln!(out, "Started:    {}", record.start_time.to_rfc3339());
        }
        None => {
            let _ = writeln!(out, "Delivery:   none");
        }
    }
    match &snapshot.last_fix {
        Some(fix) => {
            let _ = writeln!(
                out,
                "Last fix:   {:.5}, {:.5} at {}",
                fix.latitude,
                fix.longitude,
                fix.timestamp.to_rfc3339()
            );
        }
        None => {
            let _ = writeln!(out, "Last fix:   none");
        }
    }
    out
}

/// Render the effective configuration for humans.
#[must_use]
pub fn render_config(config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Current Configuration");
    let _ = writeln!(out, "=====================");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Channel]");
    let _ = writeln!(out, "  URL:                {}", config.channel.url);
    let _ = writeln!(
        out,
        "  Reconnect backoff:  {} ms .. {} ms",
        config.channel.reconnect_initial_ms, config.channel.reconnect_max_ms
    );
    let _ = writeln!(out, "  Outbound buffer:    {}", config.channel.outbound_buffer);
    let _ = writeln!(out);
    let _ = writeln!(out, "[API]");
    let _ = writeln!(out, "  Base URL:           {}", config.api.base_url);
    let _ = writeln!(out, "  Timeout (s):        {}", config.api.request_timeout_secs);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Storage]");
    let _ = writeln!(out, "  Database path:      {}", config.database_path().display());
    let _ = writeln!(out);
    let _ = writeln!(out, "[Location]");
    let _ = writeln!(out, "  Source:             {}", config.location.source);
    let _ = writeln!(out, "  Interval (s):       {}", config.location.deferred_interval_secs);
    let _ = writeln!(out, "  Min distance (m):   {}", config.location.distance_interval_m);
    out
}
