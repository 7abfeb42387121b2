//! OLAF/Neighbourhood home server library.
//!
//! The binary in `main.rs` is a thin wrapper; the router and handlers live
//! here so the integration tests can run the real server on an ephemeral
//! port.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use olafchat_core::server::ServerNode;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

pub mod files;
pub mod ws;

pub use files::{FileStore, MAX_UPLOAD_BYTES};

/// Shared state behind every HTTP and WebSocket handler.
pub struct AppState {
    /// The protocol engine.
    pub node: Arc<ServerNode>,
    /// Blob store for the file surface.
    pub files: FileStore,
    /// Address used when minting download URLs.
    pub public_addr: String,
}

/// Assemble the server's single HTTP surface: the WebSocket endpoint at
/// `/` and the file-transfer routes, with the upload size cap applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/api/upload", post(files::upload))
        .route("/downloads/:name", get(files::download))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .with_state(state)
}
