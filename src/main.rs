// SPDX-License-Identifier: MIT
mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands, TokenCommands};
use conclave_router::auth::Authenticator;
use conclave_router::config::RouterConfig;
use conclave_router::router::Router;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Serve {
            port,
            url,
            jwt_secret,
            clustered,
            config,
        } => run_serve(*port, url.clone(), jwt_secret.clone(), *clustered, config.as_deref()).await,
        Commands::Token { command } => run_token_command(command).await,
        Commands::ShowConfig { config } => {
            let cfg = conclave_router::config::load("conclave", config.as_deref())?;
            println!("{}", serde_yaml_string(&cfg)?);
            Ok(())
        }
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            Ok(())
        }
    }
}

fn serde_yaml_string(cfg: &RouterConfig) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(cfg)?)
}

async fn run_serve(
    port: Option<u16>,
    url: Option<String>,
    jwt_secret: Option<String>,
    clustered: bool,
    config_path: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let mut config = conclave_router::config::load("conclave", config_path)?;
    if port.is_some() {
        config.port = port;
    }
    if url.is_some() {
        config.url = url;
    }
    if jwt_secret.is_some() {
        config.jwt_secret = jwt_secret;
    }
    config.clustered = config.clustered || clustered;

    let auth = Authenticator::new(config.jwt_secret.clone());
    let router = Router::with_default_service(
        auth,
        Duration::from_secs(config.method_timeout_s),
        config.default_service.clone(),
    );

    for ws_id in ["default", "public"] {
        let workspace = router.workspaces.get(ws_id).expect("pre-created at startup");
        conclave_router::workspace_service::ensure_installed(&router, &workspace, &router.default_service);
    }

    if config.clustered {
        let store = conclave_router::cluster::InMemoryClusterStore::new();
        let server_id = config
            .server_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let coordinator = conclave_router::cluster::ClusterCoordinator::new(
            store,
            server_id,
            Arc::downgrade(&router),
            Duration::from_secs(config.cluster_options.heartbeat_interval_s),
            Duration::from_secs(config.cluster_options.cleanup_interval_s),
            Duration::from_secs(config.cluster_options.server_ttl_s),
        );
        coordinator.spawn("0.0.0.0", config.resolve_port());
        router.set_cluster(coordinator);
        tracing::info!("clustering enabled");
    }

    let app = conclave_router::http::build_app(router, config.max_body_bytes);
    let addr: SocketAddr = format!("{}:{}", config.bind_host, config.resolve_port()).parse()?;
    tracing::info!(%addr, "conclave router listening");
    conclave_router::http::serve(app, addr).await?;
    Ok(())
}

async fn run_token_command(cmd: &TokenCommands) -> anyhow::Result<()> {
    let TokenCommands::Show { token, jwt_secret } = cmd;
    let Some(secret) = jwt_secret else {
        anyhow::bail!(
            "pass --jwt-secret to verify and decode this token, or an opaque token's claims \
             can only be resolved by the issuing router itself"
        );
    };
    let auth = Authenticator::new(Some(secret.clone()));
    let claims = auth.verify_jwt(token)?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}
