//! `couriertrack` - CLI for courier-tracker
//!
//! Runs the tracker in the foreground and inspects or clears the persisted
//! tracking state.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

use courier_tracker::cli::{render_config, render_status, Cli, Command, ConfigCommand, RunCommand};
use courier_tracker::{
    init_logging, ArmState, ChannelNotice, Config, Credential, DeliveryId, ReconcileOutcome,
    Storage, Tracker, TrackingHandle,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let command = match cli.command {
        Command::Config(ConfigCommand::Path) => {
            println!("{}", Config::default_config_path().display());
            return Ok(());
        }
        Command::Config(ConfigCommand::Validate { file }) => {
            return handle_validate(file.or(cli.config));
        }
        Command::Config(ConfigCommand::Show { json }) => LoadedCommand::Show { json },
        Command::Run(run) => LoadedCommand::Run(run),
        Command::Status(status) => LoadedCommand::Status { json: status.json },
        Command::Stop => LoadedCommand::Stop,
    };

    let config = Config::load_from(cli.config).context("failed to load configuration")?;
    match command {
        LoadedCommand::Run(run) => handle_run(&config, run).await,
        LoadedCommand::Status { json } => handle_status(&config, json),
        LoadedCommand::Stop => handle_stop(&config),
        LoadedCommand::Show { json } => handle_show(&config, json),
    }
}

/// Commands that need the loaded configuration.
#[derive(Debug)]
enum LoadedCommand {
    Run(RunCommand),
    Status { json: bool },
    Stop,
    Show { json: bool },
}

async fn handle_run(config: &Config, cmd: RunCommand) -> anyhow::Result<()> {
    let tracker = Tracker::from_config(config).context("failed to start tracker")?;
    tracker.init();
    let mut notices = tracker.subscribe();
    let mut outcomes = tracker.reconcile_outcomes();

    if let Some(token) = cmd.token {
        tracker
            .sign_in(Credential::new(token))
            .await
            .context("failed to connect to the tracking server")?;
    } else {
        warn!("No token given; fixes are stored locally but not sent");
    }

    let mut handle = match cmd.delivery {
        Some(id) => Some(
            tracker
                .start_tracking(DeliveryId::new(id))
                .await
                .context("failed to start tracking")?,
        ),
        None => None,
    };

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Dropped channel notices"),
                Err(RecvError::Closed) => break Ok(()),
            },
            outcome = outcomes.recv() => {
                if let Ok(outcome) = outcome {
                    print_outcome(&outcome);
                }
            }
            ended = terminated(&mut handle) => match ended {
                ArmState::Failed(message) => {
                    error!("Location tracking failed: {}", message);
                    break Err(anyhow::anyhow!("location tracking failed: {message}"));
                }
                other => {
                    println!("Tracking ended: {other:?}");
                    break Ok(());
                }
            },
        }
    };

    tracker.shutdown().await;
    result
}

async fn terminated(handle: &mut Option<TrackingHandle>) -> ArmState {
    match handle {
        Some(handle) => handle.terminated().await,
        None => std::future::pending().await,
    }
}

fn print_notice(notice: &ChannelNotice) {
    match notice {
        ChannelNotice::State(state) => println!("channel: {state}"),
        ChannelNotice::TrackingResumed { downtime } => match downtime {
            Some(secs) => println!("server: tracking resumed after {secs:.0}s"),
            None => println!("server: tracking resumed"),
        },
        ChannelNotice::ServerError { message } => println!("server error: {message}"),
        ChannelNotice::Authenticated { message } => println!("server: {message}"),
    }
}

fn print_outcome(outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Idle => {}
        ReconcileOutcome::Resumed {
            delivery_id,
            downtime_secs,
            ..
        } => println!("resumed {delivery_id} after {downtime_secs}s"),
        ReconcileOutcome::Discarded { delivery_id, reason } => {
            println!("discarded {delivery_id}: {reason}");
        }
        ReconcileOutcome::Deferred { reason, .. } => println!("resume deferred: {reason}"),
    }
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let path = config.database_path();
    let storage = Storage::open(&path)?;
    let snapshot = storage.snapshot()?;
    if json {
        let status = serde_json::json!({
            "database_path": path,
            "record": snapshot.record,
            "last_fix": snapshot.last_fix,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render_status(&snapshot, &path));
    }
    Ok(())
}

fn handle_stop(config: &Config) -> anyhow::Result<()> {
    let storage = Storage::open(config.database_path())?;
    let snapshot = storage.snapshot()?;
    storage.clear_tracking_state()?;
    match snapshot.record {
        Some(record) => println!("Cleared tracking state for {}", record.delivery_id),
        None => println!("No tracking state to clear"),
    }
    Ok(())
}

fn handle_show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", render_config(config));
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}
