//! `relay-chat` binary: runs the demo chat server.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_chat::{Account, ChatService, UserStore, build_server};
use relay_settings::{load_settings, load_settings_from_path};
use tracing::info;

/// Demo chat server on the relay engine.
#[derive(Parser, Debug)]
#[command(name = "relay-chat", about = "Demo chat server on the relay engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until Ctrl-C.
    Serve {
        /// Settings file (defaults to `~/.relay/settings.json`).
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Log filter when `RUST_LOG` is unset (overrides settings).
        #[arg(long)]
        log_level: Option<String>,

        /// Extra account as `name:password`; repeatable.
        #[arg(long = "seed-user", value_name = "NAME:PASSWORD")]
        seed_users: Vec<String>,

        /// Skip the built-in demo accounts.
        #[arg(long, default_value_t = false)]
        no_demo_accounts: bool,

        /// Chat lines kept for ONLINE history.
        #[arg(long, default_value_t = relay_chat::log::DEFAULT_CAPACITY)]
        history: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            settings,
            log_level,
            seed_users,
            no_demo_accounts,
            history,
        } => serve(settings, log_level, &seed_users, no_demo_accounts, history).await,
    }
}

async fn serve(
    settings_path: Option<PathBuf>,
    log_level: Option<String>,
    seed_users: &[String],
    no_demo_accounts: bool,
    history: usize,
) -> Result<()> {
    let settings = match settings_path {
        Some(ref path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    let level = log_level.unwrap_or_else(|| settings.log_level.0.clone());
    relay_core::logging::init_subscriber(&level);

    let users = if no_demo_accounts {
        UserStore::new()
    } else {
        UserStore::with_demo_accounts()
    };
    for spec in seed_users {
        users.add(Account::parse_seed(spec)?);
    }
    info!(accounts = users.len(), "user store ready");

    let metrics = relay_server::metrics::install_recorder().context("failed to install metrics recorder")?;
    let service = ChatService::new(Arc::new(users), history);
    let running = build_server(&service, settings.server)
        .with_metrics_handle(metrics)
        .start()
        .await
        .context("failed to start server")?;

    info!(tcp = ?running.tcp_addr, ws = ?running.ws_addr, "relay-chat running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    running.shutdown().await;
    Ok(())
}
