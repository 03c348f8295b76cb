//! # parley-server
//!
//! Real-time chat server.
//!
//! This binary provides:
//! - **Connection registry** mapping each online user to their routed
//!   WebSocket connection, with presence broadcast on every change
//! - **Group rooms** for live group delivery, gated on current membership
//! - **Fan-out** of persisted messages and reactions, falling back to push
//!   notifications for recipients without a live delivery
//! - **REST API** (axum) for sending, listing and reacting to messages,
//!   managing groups and registering push endpoints

mod api;
mod chat;
mod config;
mod error;
mod fanout;
mod push;
mod registry;
mod rooms;
mod storage;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::api::AppState;
use crate::chat::ChatService;
use crate::config::ServerConfig;
use crate::fanout::FanoutEngine;
use crate::push::{LogGateway, NotificationFallback, PushGateway, WebhookGateway};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?.with_max_text_len(config.max_text_len);
    info!(path = %config.database_path.display(), "Database ready");
    let db = storage::shared(db);

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let gateway: Arc<dyn PushGateway> = if config.push_enabled {
        Arc::new(WebhookGateway::new(config.push_timeout)?)
    } else {
        info!("Push notifications disabled, offline deliveries will only be logged");
        Arc::new(LogGateway)
    };

    let registry = ConnectionRegistry::new();
    let rooms = RoomManager::new(registry.clone());
    let push = NotificationFallback::new(db.clone(), gateway);
    let fanout = FanoutEngine::new(registry.clone(), rooms.clone(), push);
    let chat = ChatService::new(db, registry, rooms, fanout);

    let http_addr = config.http_addr;
    let app_state = AppState {
        chat,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
