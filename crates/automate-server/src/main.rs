//! Automate server
//!
//! Loads a configuration directory, runs the engine and shuts it down
//! cleanly on Ctrl-C.
//!
//! # Environment Variables
//!
//! - `AUTOMATE_LOG`: log filter directives (default `info`)
//! - `AUTOMATE_CONFIG_DIR`: configuration directory

mod app;

use anyhow::Result;
use automate_event_bus::EventBus;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reactive home automation engine
#[derive(Parser, Debug)]
#[command(name = "automate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration directory; `secrets.yaml` is read from here
    #[arg(short = 'c', long, env = "AUTOMATE_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Main configuration file, relative to the configuration directory
    #[arg(short, long, default_value = "automate.yaml")]
    file: PathBuf,

    /// Load and build the configuration, then exit
    #[arg(long)]
    check: bool,

    /// Print a JSON snapshot of every object and program on exit
    #[arg(long)]
    dump: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("AUTOMATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(config_dir = %args.config_dir.display(), file = %args.file.display(), "Starting Automate");

    let bus = Arc::new(EventBus::new());
    let system = app::load_system(&args.config_dir, &args.file, bus.clone())?;

    if args.check {
        info!(
            objects = system.objects().len(),
            programs = system.programs().len(),
            "Configuration is valid"
        );
        system.shutdown();
        return Ok(());
    }

    let events = tokio::spawn(app::log_events(bus));
    info!("Automate is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    system.shutdown();
    events.abort();
    if args.dump {
        println!("{}", serde_json::to_string_pretty(&system.snapshot())?);
    }

    Ok(())
}
