mod cli;
mod config;
mod connection;
mod error;
mod handlers;
mod keys;
mod messages;
mod monitor;
mod registry;
mod session;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber;

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{
        create_browser_session, get_session_status, health_check, login, logout,
        post_monitor_event, AppState,
    },
    monitor::{command_channel, event_channel, run_event_pump, spawn_command_logger},
    registry::SessionRegistry,
    websocket::{websocket_handler, SocketRouter},
};
use clap::Parser;

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        browser_session,
        message,
    }) = cli.command
    {
        if let Err(e) = cli::run_probe_client(url, browser_session, message).await {
            error!("Probe client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("Starting monitor hub on port {}", config.port);
    info!("Cleanup grace: {} ms", config.cleanup_grace_ms);
    info!("User linger: {} ms", config.user_linger_ms);

    let (command_tx, command_rx) = command_channel();
    let (events_tx, events_rx) = event_channel();

    let registry = Arc::new(SessionRegistry::new(&config, command_tx.clone()));

    // Backend plumbing: events flow in through the pump, commands flow out
    // through the logger stand-in for the message bus bridge.
    tokio::spawn(run_event_pump(
        Arc::clone(&registry),
        events_rx,
        command_tx,
    ));
    spawn_command_logger(command_rx);

    let app_state = AppState {
        registry: Arc::clone(&registry),
        events_tx,
        base_url: config.base_url.clone(),
    };
    let socket_router = SocketRouter::new(registry);

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(login))
        .route("/sessions/:id", get(get_session_status).delete(logout))
        .route("/sessions/:id/browsers", post(create_browser_session))
        .route("/monitor/events", post(post_monitor_event))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(socket_router);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Monitor hub listening on {}", addr);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
