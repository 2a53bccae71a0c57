//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Run command arguments.
#[derive(Args)]
pub struct RunCommand {
    /// Start tracking this delivery once running
    #[arg(short, long, value_name = "ID")]
    pub delivery: Option<String>,

    /// Bearer token for the tracking server
    #[arg(long, env = "COURIER_TRACKER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl std::fmt::Debug for RunCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCommand")
            .field("delivery", &self.delivery)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_debug() {
        let cmd = RunCommand {
            delivery: Some("DEL9".to_string()),
            token: Some("secret".to_string()),
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("DEL9"));
        assert!(!debug_str.contains("secret"));
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }
}
