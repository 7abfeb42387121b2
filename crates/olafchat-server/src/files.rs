//! The HTTP file-transfer surface.
//!
//! `POST /api/upload` stores a raw body and returns the download URL;
//! `GET /downloads/<name>` streams it back. Blobs are opaque and the
//! surface performs no authentication; clients exchange the minted URLs
//! inside encrypted chat.

use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum accepted upload size (10 MiB).
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// On-disk blob store with collision-free naming.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create the store, ensuring the directory exists.
    pub async fn new(dir: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Store a blob, returning the minted name.
    ///
    /// A random hex prefix avoids collisions while keeping the client's
    /// filename usable in the URL.
    pub async fn store(&self, filename: &str, data: &[u8]) -> std::io::Result<String> {
        let prefix = hex::encode(olafchat_core::crypto::random_bytes::<8>());
        let name = format!("{}_{}", prefix, sanitize_filename(filename));
        tokio::fs::write(self.dir.join(&name), data).await?;
        Ok(name)
    }

    /// Read a blob back by its minted name.
    pub async fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(name)).await
    }
}

/// Strip anything path-like out of a client-supplied filename.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    /// Client-supplied filename hint.
    pub filename: Option<String>,
}

/// Handler for `POST /api/upload`: store the raw request body.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, StatusCode> {
    let filename = params.filename.as_deref().unwrap_or("upload.bin");
    let name = state.files.store(filename, &body).await.map_err(|e| {
        warn!(error = %e, "failed to store upload");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!(name = %name, size = body.len(), "file uploaded");
    let file_url = format!("http://{}/downloads/{}", state.public_addr, name);
    Ok(Json(json!({ "file_url": file_url })))
}

/// Handler for `GET /downloads/<name>`: stream a stored blob.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    // The minted names never contain separators; anything path-like is an
    // escape attempt.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(StatusCode::NOT_FOUND);
    }
    match state.files.read(&name).await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            debug!(name = %name, error = %e, "download miss");
            Err(StatusCode::NOT_FOUND)
        }
    }
}
