// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! parley-relay: development relay server for parley sync clients.

use std::net::SocketAddr;

use clap::Parser;
use parley_relay::{server, RelayState};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// parley-relay: conversation relay server
#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "WebSocket relay server for parley sync clients")]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:7890")]
    bind: SocketAddr,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Do not echo client ids on canonical messages
    #[arg(long)]
    no_echo_client_ids: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting parley-relay");
    info!("  Bind address: {}", args.bind);

    let state = RelayState::default();
    if args.no_echo_client_ids {
        info!("  Client id echo: disabled");
        state.with_ledger(|ledger| ledger.set_echo_client_ids(false)).await;
    }

    server::run(args.bind, state).await
}
