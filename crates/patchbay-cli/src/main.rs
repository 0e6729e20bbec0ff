//! Patchbay CLI
//!
//! Connects to a Patchbay audio host, mirrors its state through the core
//! synchronization layer, and prints connection-state transitions and
//! selected push traffic. Useful for watching a host from a terminal and
//! for exercising the protocol without a browser UI.

use clap::Parser;
use patchbay_core::{Session, SessionConfig};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Patchbay - terminal mirror for a Patchbay audio host
#[derive(Parser, Debug)]
#[command(name = "patchbay")]
#[command(version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the host
    #[arg(short, long, default_value = "ws://192.168.51.1/websocket")]
    url: String,

    /// Address to probe when the host changes its network identity during
    /// a hotspot switch; may be given multiple times
    #[arg(long = "candidate")]
    candidates: Vec<String>,

    /// Print the loaded pedalboard as JSON
    #[arg(long)]
    dump: bool,

    /// Keep running and print state transitions and pushed changes
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> patchbay_core::Result<()> {
    let mut config = SessionConfig::new(&args.url);
    config.candidate_addresses = args.candidates;

    tracing::info!("Connecting to {}", args.url);
    let session = Session::connect(config).await?;

    let pedalboard = session.cache().pedalboard.get();
    let configuration = session.cache().jack_configuration.get();
    println!("Connected to {}", args.url);
    println!(
        "Pedalboard: {:?} ({} plugins, {} connections)",
        pedalboard.title,
        pedalboard.plugins.len(),
        pedalboard.connections.len()
    );
    println!(
        "Audio engine: {} Hz, {} frames, {} xruns",
        configuration.sample_rate, configuration.buffer_size, configuration.xruns
    );
    if args.dump {
        if let Ok(text) = serde_json::to_string_pretty(&pedalboard) {
            println!("{text}");
        }
    }

    if !args.watch {
        session.close();
        return Ok(());
    }

    session.connection_state().subscribe(|state| {
        println!("state: {state:?}");
    });
    session.alerts().subscribe(|alert: &String| {
        println!("alert: {alert}");
    });
    session.server_address_changed().subscribe(|address: &String| {
        println!("host moved to {address}; reconnect there");
    });
    session.client_stale().subscribe(|version: &String| {
        println!("host is now version {version}; this client must be restarted");
    });
    session.cache().pedalboard.subscribe(|pedalboard| {
        println!(
            "pedalboard: {:?} ({} plugins)",
            pedalboard.title,
            pedalboard.plugins.len()
        );
    });
    session.cache().update_status.subscribe(|status| {
        println!("update: {status:?}");
    });

    tracing::info!("Watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| patchbay_core::ClientError::SessionFailed(e.to_string()))?;
    session.close();
    Ok(())
}
