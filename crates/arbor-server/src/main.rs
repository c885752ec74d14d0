//! # arbor-server
//!
//! Server for the Arbor end-to-end encrypted messaging core.
//!
//! This binary provides:
//! - **Realtime fan-out** over WebSocket: connections subscribe to threads
//!   and receive new/deleted message events, each rendered with that
//!   connection's own cached private key
//! - **Chat API** (axum) for unlock/lock, sending, history, and thread
//!   membership
//! - **KEM primitives API** exposing ML-KEM-768 operations behind an
//!   API-key gate
//!
//! Message bodies and unwrapped message keys never exist here in
//! plaintext outside a request in flight; at rest everything is ciphertext.

mod api;
mod chat;
mod config;
mod error;
mod kem_api;
mod registry;
mod session;
mod ws;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_store::Database;

use crate::api::AppState;
use crate::chat::ChatService;
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::session::SessionKeyCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arbor_server=debug")),
        )
        .init();

    info!("Starting Arbor server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        db = %config.database_path.display(),
        kem_api_gated = !config.kem_api_keys.is_empty(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    // One registry per server instance, shared by reference with every
    // handler; its lifecycle is the server's, not the process loader's.
    let registry = Arc::new(Registry::new());
    let sessions = SessionKeyCache::new();

    let chat = ChatService::new(
        Arc::new(Mutex::new(db)),
        registry,
        sessions,
        config.max_message_length,
    );

    let http_addr = config.http_addr;
    let app_state = AppState {
        chat,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP/WebSocket server (blocks until shutdown)
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
