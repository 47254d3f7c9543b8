//! SocialApp Relay Server
//!
//! A lightweight WebSocket relay for real-time direct messages:
//!
//! 1. **Presence tracking**: each connection binds to an authenticated user
//!    via a `join` handshake; a user may hold several live sessions at once
//!    (multiple tabs or devices).
//!
//! 2. **Delivery routing**: chat events fan out to every live session of the
//!    addressee, best-effort. Recipients with no live session read the
//!    message later from the durable store.
//!
//! The relay is purely transient: it persists nothing and is rebuilt empty
//! on restart. Clients write each message through the web application's REST
//! API alongside the live send, so history stays correct even when a live
//! push is missed.

mod auth;
mod handler;
mod protocol;
mod registry;
mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "socialapp-relay", version, about = "SocialApp real-time message relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 4000, env = "RELAY_PORT")]
    port: u16,

    /// HS256 secret the web application signs auth tokens with
    #[arg(long, default_value = "your-secret-key", env = "RELAY_JWT_SECRET")]
    jwt_secret: String,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "socialapp_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        jwt_secret: args.jwt_secret.into_bytes(),
    };
    let state = RelayState::new(config);

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("SocialApp relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "socialapp-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_users": state.registry.online_users(),
        "live_sessions": state.registry.session_count(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
