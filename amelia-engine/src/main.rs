use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use amelia_core::config::ProfileStore;
use amelia_core::Storage;
use amelia_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use amelia_server::AppState;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "amelia-engine")]
#[command(about = "Headless Amelia orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the HTTP/WebSocket server (§6.1, §6.2).
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4731)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long, default_value = "amelia")]
        server_name: String,
    },
    /// Lists every profile visible on the configured search path.
    Profiles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(None);
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let _guard = init_process_logging(ProcessKind::Engine, &logs_dir, 14)
        .map(|(guard, info)| {
            info!(logs_dir = %info.logs_dir, "structured logging initialized");
            guard
        })
        .ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            server_name,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let storage = Storage::connect(state_dir.join("amelia.sqlite")).await?;
            let profiles = Arc::new(ProfileStore::from_default_dirs());
            let app_state = AppState::new(storage, profiles, server_name);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(%addr, state_dir = %state_dir.display(), "starting amelia-engine");
            amelia_server::serve(app_state, addr).await?;
        }
        Command::Profiles => {
            let profiles = ProfileStore::from_default_dirs();
            for name in profiles.list().await? {
                println!("{name}");
            }
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("AMELIA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".amelia")
}
