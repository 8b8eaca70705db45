//! Command-line interface for vocalink
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time voice conversation pipeline
#[derive(Parser, Debug)]
#[command(name = "vocalink", version, about = "Real-time voice conversation pipeline")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Options shared by the conversation commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Cancel the session after this long without activity. Examples: 30s, 5m, 0 disables
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Delay between streamed reply words. Examples: 40ms, 0.1s
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub word_delay: Option<Duration>,

    /// Do not greet the user on connect
    #[arg(long)]
    pub no_greeting: bool,

    /// Log per-turn latency and print a summary
    #[arg(long)]
    pub metrics: bool,

    /// Print pipeline events as JSON lines on stderr
    #[arg(long)]
    pub events: bool,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`, plus bare numbers
/// (seconds).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("invalid duration: {}", s));
        }
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream a WAV file through the pipeline as one user turn
    Run {
        /// 16-bit PCM WAV file
        #[arg(value_name = "WAV")]
        input: PathBuf,

        /// What the user said, as a peer-side recognizer would report it
        #[arg(long, value_name = "TEXT")]
        text: Option<String>,

        /// Write response audio to this WAV file
        #[arg(long, short = 'o', value_name = "PATH")]
        output: Option<PathBuf>,

        /// Pace input at real time instead of as fast as possible
        #[arg(long)]
        realtime: bool,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Type user turns on stdin; replies stream to stdout
    Chat {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Get a configuration value by key (e.g., vad.stop_secs)
    Get {
        /// Dotted key path (e.g., vad.stop_secs, session.idle_timeout_secs)
        key: String,
    },
    /// Show the effective configuration
    Show,
    /// Print the configuration file location
    Path,
    /// Dump a commented configuration template
    Dump,
}
