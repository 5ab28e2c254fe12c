//! CLI command definitions for mission-control
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::config::Config;
use crate::logging::LogTarget;
use clap::{Parser, Subcommand};

/// Mission Control: task orchestration for AI agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (replaces the tier merge)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to the JSON data file (overrides config)
    #[arg(short, long, global = true)]
    pub data: Option<String>,

    /// Port for the REST API (default: 31994)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Agent-runner gateway WebSocket URL (overrides config)
    #[arg(long, global = true)]
    pub gateway_url: Option<String>,

    /// Run without contacting the agent-runner gateway
    #[arg(long, global = true)]
    pub no_gateway: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the REST API and gateway client (default if no subcommand given)
    Serve,

    /// Check the data file for broken invariants and dangling references
    Check,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }

    pub fn log_target(&self) -> LogTarget {
        LogTarget::parse(&self.log)
    }

    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(data) = &self.data {
            config.server.data_path = data.into();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.url = url.clone();
        }
        if self.no_gateway {
            config.gateway.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["mission-control"]);
        assert_eq!(cli.command(), Command::Serve);
        assert_eq!(cli.log_target(), LogTarget::Stderr);
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "mission-control",
            "--data",
            "/srv/mc.json",
            "--port",
            "9100",
            "--gateway-url",
            "ws://10.0.0.2:18789",
            "--no-gateway",
            "check",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(cli.command(), Command::Check);
        assert_eq!(config.server.data_path, PathBuf::from("/srv/mc.json"));
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.gateway.url, "ws://10.0.0.2:18789");
        assert!(!config.gateway.enabled);
    }
}
