use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod control;
mod error;
mod game;
mod remote;
mod store;

use config::Config;
use control::AppState;
use remote::{HttpAuthenticator, Remote, WsConnector};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::parse());
    config.validate()?;

    if config.demo {
        info!("DEMO mode – tickets stay local (credit: {:.2})", config.demo_credit);
    } else {
        info!("LIVE mode – tickets WILL be sent to {:?}", config.api);
    }

    let store = Store::open(&config.database_path, &config.data_dir, &config.cache_dir)?;
    info!("Session cache opened: {}", config.database_path);

    let connector = WsConnector::new(&config.socket_url)?;
    let remote = Remote {
        auth: Arc::new(HttpAuthenticator::new(config.api)?),
        proxy_host: connector.origin(),
        connector: Arc::new(connector),
    };

    let state = AppState::new(config.clone(), store, remote);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        match state.login(username, password).await {
            Ok(status) => info!("[{}] started at boot {}", username, status),
            Err(e) => error!("[{}] boot login failed: {:#}", username, e),
        }
    }

    let app = control::router(state.clone());
    let addr: SocketAddr = config.control_addr.parse()?;
    info!("Control plane listening on ws://{}/ws", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Serve until Ctrl-C, then take every user down
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    state.shutdown().await;
    info!("Shut down");

    Ok(())
}
