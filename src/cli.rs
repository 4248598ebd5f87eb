//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Task planning API - bearer-authenticated plan generation and history
#[derive(Parser, Debug)]
#[command(name = "taskplan-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TASKPLAN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TASKPLAN_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TASKPLAN_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TASKPLAN_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TASKPLAN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the API server (default)
    Serve,

    /// Apply database migrations and exit
    Migrate,
}
