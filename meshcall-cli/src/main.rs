//! meshcall CLI application

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use meshcall_core::classify;
use settings::Overrides;
use simulation::{SimulationOptions, SimulationReport};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod settings;
mod simulation;

/// Filter used when neither `--log` nor `RUST_LOG` is set
const DEFAULT_LOG_FILTER: &str = "meshcall=info";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON config file (defaults to meshcall.json in the platform config dir)
    #[arg(short, long, env = "MESHCALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. "meshcall=debug"
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a group call between in-process participants
    Simulate {
        /// Participants, initiator included
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Seconds the call stays up once everyone is connected
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Initiator shares its screen
        #[arg(long)]
        share: bool,

        /// Initiator records the call
        #[arg(long)]
        record: bool,

        /// Seed for names and link statistics
        #[arg(long)]
        seed: Option<u64>,

        /// Print the report as JSON instead of the event stream
        #[arg(long)]
        json: bool,
    },

    /// Classify link quality from loss and round-trip time
    Classify {
        /// Packet loss rate between 0 and 1
        #[arg(long)]
        loss: f64,

        /// Round-trip time in milliseconds
        #[arg(long)]
        rtt: f64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let settings = settings::load(cli.config.as_deref(), &cli.overrides)?;
    match &settings.source {
        Some(path) => tracing::debug!(path = %path.display(), "Using config file"),
        None => tracing::debug!("Using default configuration"),
    }

    match cli.command {
        Commands::Simulate {
            participants,
            seconds,
            share,
            record,
            seed,
            json,
        } => {
            let options = SimulationOptions {
                participants,
                seconds,
                share,
                record,
                seed,
                print_events: !json,
            };
            let report = simulation::run(settings.mesh, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Classify { loss, rtt } => {
            println!("{}", handle_classify(loss, rtt)?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings.mesh)?);
        }
    }

    Ok(())
}

fn init_tracing(directive: Option<&str>) {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_classify(loss: f64, rtt: f64) -> Result<String> {
    if !(0.0..=1.0).contains(&loss) {
        bail!("loss must be between 0 and 1, got {loss}");
    }
    if !rtt.is_finite() || rtt < 0.0 {
        bail!("rtt must be a non-negative number of milliseconds, got {rtt}");
    }
    Ok(classify(loss, rtt).to_string())
}

fn print_report(report: &SimulationReport) {
    println!();
    println!("📊 Call {}", report.call_id);
    println!("==========================");
    for participant in &report.participants {
        println!(
            "{:<14} links {:>2} | streams {:>2} | events {:>4} | samples {:>3}",
            participant.user_id,
            participant.connected_links,
            participant.remote_streams,
            participant.events,
            participant.quality_samples
        );
        for (peer, quality) in &participant.quality {
            println!("    ↳ {peer}: {quality}");
        }
    }
    if let Some(recording) = &report.recording {
        println!(
            "🎥 Recording: {} | {} bytes | {} chunks | {} tracks",
            recording.mime_type, recording.size_bytes, recording.chunk_count, recording.tracks
        );
    }
}
