// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

/// `conclave token` subcommands.
#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Decode and print a JWT's claims without contacting a server.
    ///
    /// Verifies the signature when --jwt-secret is supplied (recommended);
    /// without it the claims are parsed but not authenticated. Opaque
    /// tokens carry no embedded claims and can only be resolved by the
    /// issuing router itself, over its own `generate_token`/handshake path.
    Show {
        /// The token to inspect.
        token: String,
        /// Shared secret to verify the signature against.
        #[arg(long, env = "CONCLAVE_JWT_SECRET")]
        jwt_secret: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the router's HTTP/WebSocket server.
    Serve {
        /// Bind port (overrides config and the `url` trailing port).
        #[arg(long, short = 'p')]
        port: Option<u16>,
        /// Advertised URL, e.g. `wss://0.0.0.0:9527`.
        #[arg(long)]
        url: Option<String>,
        /// Shared secret enabling JWT verification/minting.
        #[arg(long, env = "CONCLAVE_JWT_SECRET")]
        jwt_secret: Option<String>,
        /// Join the cluster coordination store instead of running standalone.
        #[arg(long)]
        clustered: bool,
        /// Path to a router config file (overrides auto-discovery).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Mint or inspect tokens.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Print the effective configuration and exit.
    ShowConfig {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Generate shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "conclave",
    about = "In-process RPC and service-brokering fabric",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "conclave", &mut std::io::stdout());
}
