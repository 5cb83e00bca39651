//! Access-point network emulator CLI
//!
//! Exit codes: 0 on clean stop, 1 on configuration errors, 2 on
//! external-tool failures.

mod commands;

use apnet::EngineError;
use clap::{Parser, Subcommand};
use commands::{cmd_check, cmd_cleanup, cmd_run};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a topology from a JSON document
    Run {
        /// Topology file path
        topology: String,

        /// Start the TCP command server
        #[arg(long)]
        server: bool,

        /// Command server bind address
        #[arg(long, default_value = "127.0.0.1")]
        server_ip: String,

        /// Command server port
        #[arg(long, default_value_t = 12345)]
        server_port: u16,

        /// Mobility seed (overrides the document's config)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Validate a topology document without touching the host
    Check {
        /// Topology file path
        topology: String,
    },

    /// Sweep all engine-owned host state (namespaces, bridges, phys,
    /// containers), e.g. after a crash
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run {
            topology,
            server,
            server_ip,
            server_port,
            seed,
        } => {
            let bind = server.then_some((server_ip, server_port));
            cmd_run(&topology, bind, seed).await
        }
        Commands::Check { topology } => cmd_check(&topology).await,
        Commands::Cleanup => cmd_cleanup().await,
    };

    std::process::exit(match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e);
            match e {
                EngineError::Config(_) => 1,
                _ => 2,
            }
        }
    });
}
