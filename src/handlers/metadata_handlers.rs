//! HTTP handlers for the master's metadata operations.

use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppError,
    models::file_record::{FileRecord, ProgressReport},
    services::{
        metadata_service::{CallContext, MetadataService},
        token::bearer_token,
    },
};

/// Optional per-request timeout, in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// Body of `POST /uploads`. Missing fields reach the service as empty/zero
/// and are rejected there as invalid arguments.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RequestUploadReq {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size_bytes: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileLocation {
    pub file_id: String,
    pub storage_node_address: String,
}

fn call_context(headers: &HeaderMap) -> Result<CallContext, AppError> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(CallContext::background());
    };
    let millis = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request(format!("invalid {} header", REQUEST_TIMEOUT_HEADER)))?;
    Ok(CallContext::with_timeout(Duration::from_millis(millis)))
}

/// `POST /uploads`: register an upload.
pub async fn request_upload(
    State(service): State<MetadataService>,
    headers: HeaderMap,
    body: Result<Json<RequestUploadReq>, JsonRejection>,
) -> Result<Json<FileRecord>, AppError> {
    let Json(req) = body?;
    let ctx = call_context(&headers)?;
    let record = service.request_upload(&ctx, &req.filename, req.size_bytes)?;
    Ok(Json(record))
}

/// `GET /files/{file_id}/location`
pub async fn get_file_location(
    State(service): State<MetadataService>,
    Path(file_id): Path<String>,
) -> Result<Json<FileLocation>, AppError> {
    let storage_node_address = service.get_file_location(&file_id)?;
    Ok(Json(FileLocation {
        file_id,
        storage_node_address,
    }))
}

/// `GET /status`: every record as newline-delimited JSON, tokens omitted.
pub async fn get_system_status(
    State(service): State<MetadataService>,
) -> Result<Response, AppError> {
    let lines = service.get_system_status()?.map(|record| {
        serde_json::to_vec(&record.redacted()).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    let mut response = Response::new(Body::from_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

/// `PUT /files/{file_id}/status`: a storage node's progress report, signed
/// in the `Authorization: Bearer` header when a shared secret is set.
pub async fn report_progress(
    State(service): State<MetadataService>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ProgressReport>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(report) = body?;
    let signature = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let record = service.report_progress(&file_id, report, signature)?;
    Ok(Json(record.redacted()))
}
