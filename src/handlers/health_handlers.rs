//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok"), both roles
//! - GET /readyz   -> readiness; the master checks its store, the storage
//!   node checks disk I/O under its storage root

use crate::{handlers::transfer_handlers::StorageState, services::metadata_service::MetadataService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz` on the master: the upload store answers.
pub async fn readyz_master(State(service): State<MetadataService>) -> impl IntoResponse {
    let store_check = match service.store().len() {
        Ok(_) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    ready_response([("store", store_check)])
}

/// `GET /readyz` on a storage node.
///
/// Performs a best-effort write/read/delete against the storage root.
pub async fn readyz_storage(State(state): State<StorageState>) -> impl IntoResponse {
    let disk_check = disk_probe(state.transfer.base_path()).await;
    ready_response([("disk", disk_check)])
}

async fn disk_probe(base_path: &Path) -> (bool, Option<String>) {
    let tmp_path = base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) => {
                if bytes == b"readyz" {
                    match fs::remove_file(&tmp_path).await {
                        Ok(_) => (true, None),
                        Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
                    }
                } else {
                    let _ = fs::remove_file(&tmp_path).await;
                    (false, Some("file content mismatch".to_string()))
                }
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
    }
}

fn ready_response<const N: usize>(
    results: [(&'static str, (bool, Option<String>)); N],
) -> (StatusCode, Json<ReadyResponse>) {
    let overall_ok = results.iter().all(|(_, (ok, _))| *ok);
    let checks = results
        .into_iter()
        .map(|(name, (ok, error))| (name, CheckStatus { ok, error }))
        .collect();

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn disk_probe_passes_on_writable_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(disk_probe(dir.path()).await, (true, None));
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disk_probe_fails_on_missing_dir() {
        let dir = TempDir::new().unwrap();
        let (ok, error) = disk_probe(&dir.path().join("missing")).await;
        assert!(!ok);
        assert!(error.unwrap().contains("could not write"));
    }
}
