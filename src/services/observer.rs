//! How a storage node tells the master about the uploads it serves.
//!
//! The transfer service calls an [`UploadObserver`] when a stream opens its
//! target and when a stream ends cleanly. Observers are best-effort: a
//! failed report is logged and never fails the transfer.

use std::{future::Future, pin::Pin, time::Duration};

use reqwest::{Url, header::AUTHORIZATION};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    models::file_record::{ProgressReport, UploadStatus},
    services::{metadata_service::MetadataService, token::TokenIssuer},
};

/// Boxed future returned by observer callbacks.
pub type ObserverFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub trait UploadObserver: Send + Sync + 'static {
    /// A stream opened `file_id`; `resume_offset` bytes were already durable.
    fn upload_started<'a>(&'a self, file_id: &'a str, resume_offset: u64) -> ObserverFuture<'a>;

    /// A stream for `file_id` ended cleanly with `bytes_stored` durable bytes.
    fn upload_finished<'a>(
        &'a self,
        file_id: &'a str,
        bytes_stored: u64,
        checksum: String,
    ) -> ObserverFuture<'a>;
}

/// Observer that reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {
    fn upload_started<'a>(&'a self, _file_id: &'a str, _resume_offset: u64) -> ObserverFuture<'a> {
        Box::pin(async {})
    }

    fn upload_finished<'a>(
        &'a self,
        _file_id: &'a str,
        _bytes_stored: u64,
        _checksum: String,
    ) -> ObserverFuture<'a> {
        Box::pin(async {})
    }
}

/// In-process reporting, for a master and storage node sharing one process.
impl UploadObserver for MetadataService {
    fn upload_started<'a>(&'a self, file_id: &'a str, resume_offset: u64) -> ObserverFuture<'a> {
        Box::pin(async move {
            apply_local(self, file_id, in_progress(resume_offset));
        })
    }

    fn upload_finished<'a>(
        &'a self,
        file_id: &'a str,
        bytes_stored: u64,
        checksum: String,
    ) -> ObserverFuture<'a> {
        Box::pin(async move {
            apply_local(self, file_id, complete(bytes_stored, checksum));
        })
    }
}

fn apply_local(service: &MetadataService, file_id: &str, report: ProgressReport) {
    if let Err(err) = service.apply_progress(file_id, report) {
        warn!(file_id, "progress report rejected: {}", err);
    }
}

fn in_progress(bytes_stored: u64) -> ProgressReport {
    ProgressReport {
        status: UploadStatus::InProgress,
        bytes_stored: clamp_i64(bytes_stored),
        checksum: None,
    }
}

fn complete(bytes_stored: u64, checksum: String) -> ProgressReport {
    ProgressReport {
        status: UploadStatus::Complete,
        bytes_stored: clamp_i64(bytes_stored),
        checksum: Some(checksum),
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("invalid master url `{0}`: {1}")]
    InvalidUrl(String, String),
    #[error(transparent)]
    Client(#[from] reqwest::Error),
}

/// Reports to a remote master over HTTP (`PUT /files/{file_id}/status`),
/// signing each report when the issuer holds a shared secret.
#[derive(Debug, Clone)]
pub struct MasterNotifier {
    client: reqwest::Client,
    master_url: Url,
    tokens: TokenIssuer,
}

impl MasterNotifier {
    pub fn new(master_url: &str, tokens: TokenIssuer) -> Result<Self, NotifierError> {
        let invalid = |reason: &str| NotifierError::InvalidUrl(master_url.to_string(), reason.into());
        let parsed = Url::parse(master_url).map_err(|e| invalid(&e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a base url"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            master_url: parsed,
            tokens,
        })
    }

    /// `{master}/files/{file_id}/status`, with `file_id` as one encoded
    /// path segment.
    fn report_url(&self, file_id: &str) -> Url {
        let mut url = self.master_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["files", file_id, "status"]);
        }
        url
    }

    async fn send(&self, file_id: &str, report: ProgressReport) {
        let url = self.report_url(file_id);
        let mut request = self.client.put(url.clone()).json(&report);
        if let Some(signature) = self.tokens.sign_report(file_id, &report) {
            request = request.header(AUTHORIZATION, format!("Bearer {}", signature));
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(file_id, status = ?report.status, "reported progress to master");
            }
            Ok(resp) => {
                warn!(file_id, http_status = %resp.status(), "master rejected progress report");
            }
            Err(err) => {
                warn!(file_id, "failed to reach master at {}: {}", url, err);
            }
        }
    }
}

impl UploadObserver for MasterNotifier {
    fn upload_started<'a>(&'a self, file_id: &'a str, resume_offset: u64) -> ObserverFuture<'a> {
        Box::pin(self.send(file_id, in_progress(resume_offset)))
    }

    fn upload_finished<'a>(
        &'a self,
        file_id: &'a str,
        bytes_stored: u64,
        checksum: String,
    ) -> ObserverFuture<'a> {
        Box::pin(self.send(file_id, complete(bytes_stored, checksum)))
    }
}
