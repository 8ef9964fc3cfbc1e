//! NONOTO CLI - The `nonoto` command.
//!
//! Runs a playback session in the terminal: a demo producer keeps
//! regenerating the loop, the double-buffered scheduler swaps every new
//! generation in at the next scheduling tick and scheduled notes are logged
//! instead of played. Optionally the session follows a tempo authority,
//! either the built-in loopback or an external one over TCP.

mod demo;
mod session;
mod sink;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nonoto_core::{LatencyMode, PlaybackConfig};

use crate::session::{SessionOptions, SyncMode};

/// NONOTO - Loop playback with live content swapping
#[derive(Parser, Debug)]
#[command(name = "nonoto")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Playback transport and tempo synchronization for NONOTO", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated playback session
    Play {
        /// JSON configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Tempo in BPM (overrides the configuration)
        #[arg(short, long)]
        tempo: Option<f64>,

        /// Beats per synchronization window (overrides the configuration)
        #[arg(short, long)]
        quantum: Option<f64>,

        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(short, long)]
        seconds: Option<f64>,

        /// Length of the generated loop in bars
        #[arg(short, long, default_value_t = 2)]
        bars: u32,

        /// Seconds between two content regenerations
        #[arg(long, default_value_t = 4.0)]
        regenerate_every: f64,

        /// Synchronize with an in-process loopback tempo authority
        #[arg(long, conflicts_with = "link_addr")]
        link: bool,

        /// Synchronize with a tempo authority at HOST:PORT
        #[arg(long, value_name = "HOST:PORT")]
        link_addr: Option<String>,

        /// Use the interactive (low-latency) lookahead
        #[arg(long)]
        low_latency: bool,
    },

    /// Print the default configuration as JSON
    Config,

    /// Show version information
    Version,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<PlaybackConfig> {
    let Some(path) = path else {
        return Ok(PlaybackConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
    PlaybackConfig::from_json_str(&text)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn positive_seconds(name: &str, value: f64) -> Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        anyhow::bail!("--{name} must be a positive number of seconds, got {value}");
    }
    Ok(Duration::from_secs_f64(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Play {
            config,
            tempo,
            quantum,
            seconds,
            bars,
            regenerate_every,
            link,
            link_addr,
            low_latency,
        } => {
            init_logger();
            let mut config = load_config(config.as_ref())?;
            if let Some(tempo) = tempo {
                config.initial_tempo = tempo;
            }
            if let Some(quantum) = quantum {
                config.quantum = quantum;
            }
            if low_latency {
                config.initial_latency_mode = LatencyMode::Interactive;
            }
            config.validate().context("Invalid playback options")?;
            if bars == 0 {
                anyhow::bail!("--bars must be at least 1");
            }

            let sync = match (link, link_addr) {
                (_, Some(addr)) => SyncMode::Remote(addr),
                (true, None) => SyncMode::Loopback,
                (false, None) => SyncMode::Off,
            };
            let options = SessionOptions {
                config,
                bars,
                regenerate_every: positive_seconds("regenerate-every", regenerate_every)?,
                run_for: seconds
                    .map(|s| positive_seconds("seconds", s))
                    .transpose()?,
                sync,
            };
            session::run(options).await
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&PlaybackConfig::default())?;
            println!("{json}");
            Ok(())
        }
        Commands::Version => {
            println!("nonoto {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Part of the NONOTO project");
            println!("Loop playback with live content swapping and tempo synchronization");
            Ok(())
        }
    }
}
