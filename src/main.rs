// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use foreman_coord::coordinator;
use foreman_protocol::TokenService;
use foreman_proxy::{Proxy, ProxyError};
use foreman_store::{memory, Catalog, StoreError};

// Exit codes: 0 clean shutdown, 2 configuration error, 3 store unreachable,
// 4 port bind failure.
const EXIT_CONFIG: u8 = 2;
const EXIT_STORE: u8 = 3;
const EXIT_BIND: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Start { config } => {
            let config = foreman_config::load(config.as_deref())?;
            let store = memory::open(&config.store.uri)?;
            let catalog = Catalog::new(store);

            let bound = Proxy::new(&config).bind().await?;
            let proxy_task = tokio::spawn(bound.run());

            let coordinator = coordinator::start(&config, catalog).await?;

            info!("foreman started (proxy + coordinator)");
            wait_for_shutdown().await;
            coordinator.client.stop();
            proxy_task.abort();
            info!("foreman stopped");
            Ok(())
        }

        Commands::Proxy { config } => {
            let config = foreman_config::load(config.as_deref())?;
            let bound = Proxy::new(&config).bind().await?;
            let proxy_task = tokio::spawn(bound.run());

            info!("foreman proxy started");
            wait_for_shutdown().await;
            proxy_task.abort();
            info!("foreman proxy stopped");
            Ok(())
        }

        Commands::Coordinator { config } => {
            let config = foreman_config::load(config.as_deref())?;
            let store = memory::open(&config.store.uri)?;
            let catalog = Catalog::new(store);

            let coordinator = coordinator::start(&config, catalog).await?;

            info!("foreman coordinator started");
            wait_for_shutdown().await;
            coordinator.client.stop();
            info!("foreman coordinator stopped");
            Ok(())
        }

        Commands::ShowConfig { config } => {
            let config = foreman_config::load(config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }

        Commands::IssueToken {
            subject,
            role,
            ttl_hours,
            config,
        } => {
            let config = foreman_config::load(config.as_deref())?;
            let tokens = TokenService::new(&config.token.secret);
            let ttl = ttl_hours.unwrap_or(config.token.ttl_hours);
            let token = tokens
                .issue(&subject, role.into(), ttl)
                .context("minting token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
}

/// Map a startup failure onto the documented exit codes. Anything that is
/// not a store or bind problem counts as a configuration error.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(ProxyError::Bind { .. }) = cause.downcast_ref::<ProxyError>() {
            return EXIT_BIND;
        }
        if cause.downcast_ref::<StoreError>().is_some() {
            return EXIT_STORE;
        }
    }
    EXIT_CONFIG
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
