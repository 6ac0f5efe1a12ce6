// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use foreman_protocol::Role;

/// The coordinator of a volunteer-computing platform.
///
/// Hosts the pub/sub authorisation proxy, the control-plane dispatcher,
/// and the task scheduler.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Increase verbosity (-v: debug, -vv: trace). RUST_LOG always wins.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the full coordinator: proxy and control-plane in one process.
    ///
    /// The proxy listens on the configured port (default 6380) in front of
    /// the upstream store (default 6379). The coordinator client connects
    /// back through the proxy over loopback, mints its own bearer token at
    /// startup, and writes it to the token file for operator tools.
    Start {
        /// Path to a config file merged over the discovered layers.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Start only the authorisation proxy.
    Proxy {
        /// Path to a config file merged over the discovered layers.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Start only the coordinator client and handlers.
    ///
    /// Expects a proxy (this binary's `proxy` command, or another instance
    /// of `start`) to already be listening.
    Coordinator {
        /// Path to a config file merged over the discovered layers.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration and exit.
    ShowConfig {
        /// Path to a config file merged over the discovered layers.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Mint a bearer token for a subject and print it once.
    ///
    /// Operator tool: the token is signed with the configured secret, so
    /// it is accepted by any proxy sharing that secret.
    IssueToken {
        /// Token subject (a manager or volunteer id).
        subject: String,
        /// Role carried by the token.
        #[arg(long, value_enum, default_value_t = RoleArg::Manager)]
        role: RoleArg,
        /// Lifetime in hours; defaults to the configured TTL.
        #[arg(long)]
        ttl_hours: Option<i64>,
        /// Path to a config file merged over the discovered layers.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Coordinator,
    Manager,
    Volunteer,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Coordinator => Role::Coordinator,
            RoleArg::Manager => Role::Manager,
            RoleArg::Volunteer => Role::Volunteer,
        }
    }
}
