// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Coordinator bootstrap — assembles the runtime and starts it.
//!
//! # Startup sequence
//!
//! [`start`] performs these steps in order:
//!
//! 1. Mint the coordinator's own bearer token and persist it to the token
//!    file so operator tools can make privileged publications.
//! 2. Build the [`CoordClient`] pointed at the proxy's loopback address.
//! 3. Wire every control channel to its handler in the registry.
//! 4. Start the client: connect (bounded retries), bulk-subscribe, and
//!    spawn the dispatch loop.
//!
//! The returned [`Coordinator`] owns the client handle; callers keep it
//! alive for the life of the process.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use foreman_config::Config;
use foreman_protocol::{token, Role, TokenService};
use foreman_store::Catalog;

use crate::client::CoordClient;
use crate::handlers::{
    self, auth, bind, noop_handler, performance, volunteer, workflow, HandlerContext,
};

/// Subject the coordinator's own token is issued for.
pub const COORDINATOR_SUBJECT: &str = "COORDINATOR";

pub struct Coordinator {
    pub client: CoordClient,
    pub ctx: Arc<HandlerContext>,
}

/// Assemble and start the coordinator runtime.
pub async fn start(config: &Config, catalog: Catalog) -> anyhow::Result<Coordinator> {
    let tokens = TokenService::new(&config.token.secret);
    let coordinator_token = tokens
        .issue(COORDINATOR_SUBJECT, Role::Coordinator, config.token.ttl_hours)
        .context("minting coordinator token")?;
    token::write_coordinator_token(
        Path::new(&config.token.coordinator_token_file),
        &coordinator_token,
    )?;
    info!(
        file = %config.token.coordinator_token_file,
        "coordinator token minted and stored"
    );

    // The coordinator always reaches its proxy over loopback, which the
    // proxy trusts.
    let proxy_addr = format!("127.0.0.1:{}", config.proxy.listen_port);
    let client = CoordClient::new(
        proxy_addr,
        "coordinator",
        COORDINATOR_SUBJECT,
        config.coordinator.clone(),
        catalog.clone(),
    );

    let ctx = Arc::new(HandlerContext {
        client: client.clone(),
        catalog,
        tokens,
        coordinator_token,
        token_ttl_hours: config.token.ttl_hours,
        memo: performance::StatusMemo::default(),
    });
    register_handlers(&client, ctx.clone()).await;

    client.start().await.context("starting coordinator client")?;
    Ok(Coordinator { client, ctx })
}

/// Wire the full channel → handler registry.
pub async fn register_handlers(client: &CoordClient, ctx: Arc<HandlerContext>) {
    // Authentication
    client
        .subscribe("auth/register", bind(ctx.clone(), auth::manager_registration_handler))
        .await;
    client
        .subscribe("auth/login", bind(ctx.clone(), auth::manager_login_handler))
        .await;
    client
        .subscribe(
            "auth/volunteer_register",
            bind(ctx.clone(), volunteer::volunteer_registration_handler),
        )
        .await;
    client
        .subscribe(
            "auth/volunteer_login",
            bind(ctx.clone(), volunteer::volunteer_login_handler),
        )
        .await;

    // Workflow intake
    client
        .subscribe("workflow/submit", bind(ctx.clone(), workflow::workflow_submission_handler))
        .await;

    // Performance accounting and reassignment
    client
        .subscribe("task/status", bind(ctx.clone(), performance::task_status_handler))
        .await;
    client
        .subscribe("task/assignment", bind(ctx.clone(), performance::task_assignment_handler))
        .await;
    client
        .subscribe(
            "task/reassignment",
            bind(ctx.clone(), performance::task_reassignment_handler),
        )
        .await;

    // System channels
    client
        .subscribe("coord/heartbeat/*", bind(ctx.clone(), handlers::heartbeat_handler))
        .await;
    client
        .subscribe("coord/emergency", bind(ctx.clone(), handlers::emergency_handler))
        .await;

    // Response channels the request/response awaiter may listen on.
    client.subscribe("task/reassignment/response", noop_handler()).await;
}

// ── Unit tests ────────────────────────────────────────────────────────────────
