//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use crate::logging::LogConfig;

/// skiff - disposable evaluation sandboxes
#[derive(Parser, Debug)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "SKIFF_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "SKIFF_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a worker process (spawned by a manager).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Spawn a worker, evaluate an expression on it, print the result.
    Eval(EvalArgs),
}

/// Arguments for the internal worker mode.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Maximum concurrent evaluation threads (0 = unlimited).
    #[arg(short = 't', long, default_value_t = 0)]
    pub threads: usize,

    /// Override the listening port hint.
    #[arg(long)]
    pub port_hint: Option<u16>,
}

/// Arguments for the eval command.
#[derive(Parser, Debug)]
pub struct EvalArgs {
    /// Expression to evaluate: `path = <json>`, `path`, or a JSON literal.
    #[arg(required = true)]
    pub expr: Vec<String>,

    /// Worker program to spawn (defaults to this executable).
    #[arg(long, env = "SKIFF_WORKER")]
    pub program: Option<PathBuf>,
}

impl Cli {
    /// Build the logging configuration from the global flags.
    ///
    /// Workers get the compact preset; either way `-v` beats `--log-level`
    /// which beats the environment.
    pub fn log_config(&self) -> LogConfig {
        let base = match self.command {
            Commands::Worker(_) => LogConfig::for_worker(),
            _ => LogConfig::default(),
        };

        let base = match self.verbose {
            0 => match self.log_level.as_deref().and_then(parse_level) {
                Some(level) => base.with_level(level),
                None => base,
            },
            1 => base.with_level(Level::DEBUG),
            _ => base.with_level(Level::TRACE),
        };

        let base = match self.log_format.as_deref().and_then(|f| f.parse().ok()) {
            Some(format) => base.with_format(format),
            None => base,
        };

        base.with_env_overrides()
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
