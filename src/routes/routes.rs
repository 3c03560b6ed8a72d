//! Routers for the two roles.
//!
//! ## Master (`Router<MetadataService>`)
//! - `POST /uploads`: register an upload, returns the full record
//! - `GET  /files/{file_id}/location`: storage node for a file
//! - `PUT  /files/{file_id}/status`: progress report from a storage node
//! - `GET  /status`: every record, newline-delimited JSON
//!
//! ## Storage node (`Router<StorageState>`)
//! - `GET /stream`: WebSocket chunk stream
//! - `GET /uploads/active`: streams currently in flight
//!
//! Both mount `/healthz` and `/readyz`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz_master, readyz_storage},
        metadata_handlers::{get_file_location, get_system_status, report_progress, request_upload},
        transfer_handlers::{StorageState, list_active, stream_file},
    },
    services::metadata_service::MetadataService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the master's router. State is attached by the caller.
pub fn master_routes() -> Router<MetadataService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz_master))
        .route("/uploads", post(request_upload))
        .route("/files/{file_id}/location", get(get_file_location))
        .route("/files/{file_id}/status", put(report_progress))
        .route("/status", get(get_system_status))
}

/// Build a storage node's router.
pub fn storage_routes() -> Router<StorageState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz_storage))
        .route("/stream", get(stream_file))
        .route("/uploads/active", get(list_active))
}
