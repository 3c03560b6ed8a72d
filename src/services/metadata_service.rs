//! src/services/metadata_service.rs
//!
//! MetadataService: the master's side of an upload. It registers uploads,
//! answers placement lookups, lists what it knows and applies the progress
//! reports storage nodes send back. It never talks to a storage node itself;
//! registration and data transfer are fully decoupled.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::{StreamExt, stream::{self, BoxStream}};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    errors::Code,
    models::file_record::{FileRecord, ProgressReport, UploadStatus},
    services::{
        token::{TokenError, TokenIssuer},
        upload_store::{StoreError, UploadStore},
    },
};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("deadline exceeded before the request could be applied")]
    DeadlineExceeded,
    #[error(transparent)]
    Unauthenticated(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MetadataError {
    pub fn code(&self) -> Code {
        match self {
            MetadataError::InvalidArgument(_) => Code::InvalidArgument,
            MetadataError::NotFound(_) => Code::NotFound,
            MetadataError::DeadlineExceeded => Code::DeadlineExceeded,
            MetadataError::Unauthenticated(_) => Code::Unauthenticated,
            MetadataError::Store(_) => Code::Internal,
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Per-call context. Carries the caller's deadline, if any.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check(&self) -> MetadataResult<()> {
        if self.is_expired() {
            Err(MetadataError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// Handle to the master's state. Cheap to clone; all clones share one store.
#[derive(Clone, Debug)]
pub struct MetadataService {
    store: Arc<UploadStore>,
    tokens: TokenIssuer,
    storage_node_address: String,
}

impl MetadataService {
    pub fn new(
        store: Arc<UploadStore>,
        tokens: TokenIssuer,
        storage_node_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tokens,
            storage_node_address: storage_node_address.into(),
        }
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.store
    }

    /// Register an intended upload and return where and how to send it.
    ///
    /// Either the record is fully inserted and returned, or nothing is
    /// inserted and an error comes back.
    pub fn request_upload(
        &self,
        ctx: &CallContext,
        filename: &str,
        size_bytes: i64,
    ) -> MetadataResult<FileRecord> {
        if filename.trim().is_empty() {
            return Err(MetadataError::InvalidArgument(
                "filename is required".into(),
            ));
        }
        if size_bytes <= 0 {
            return Err(MetadataError::InvalidArgument(
                "size_bytes must be positive".into(),
            ));
        }
        ctx.check()?;

        let now = Utc::now();
        let record = self.store.insert_new(|file_id| {
            let auth_token = self.tokens.issue(&file_id);
            FileRecord {
                file_id,
                filename: filename.to_string(),
                size_bytes,
                storage_node_address: self.storage_node_address.clone(),
                auth_token,
                status: UploadStatus::Registered,
                bytes_stored: 0,
                checksum: None,
                created_at: now,
                updated_at: now,
            }
        })?;

        info!(
            file_id = %record.file_id,
            filename = %record.filename,
            size_bytes,
            "registered new upload"
        );
        Ok(record)
    }

    /// Storage node address for `file_id`.
    pub fn get_file_location(&self, file_id: &str) -> MetadataResult<String> {
        self.store
            .get(file_id)?
            .map(|record| record.storage_node_address)
            .ok_or_else(|| MetadataError::NotFound(file_id.to_string()))
    }

    /// Every known record, one stream item each.
    ///
    /// The records are copied under the guard before the stream is handed
    /// out, so a consumer never observes a half-applied update.
    pub fn get_system_status(&self) -> MetadataResult<BoxStream<'static, FileRecord>> {
        let records = self.store.snapshot()?;
        debug!(count = records.len(), "streaming system status");
        Ok(stream::iter(records).boxed())
    }

    /// Apply a progress report received from a remote storage node.
    ///
    /// With a shared secret configured, `signature` must be the node's
    /// signature over this exact report; nothing is applied otherwise.
    pub fn report_progress(
        &self,
        file_id: &str,
        report: ProgressReport,
        signature: Option<&str>,
    ) -> MetadataResult<FileRecord> {
        if let Err(err) = self.tokens.verify_report(file_id, &report, signature) {
            warn!(file_id, "refused progress report: {}", err);
            return Err(err.into());
        }
        self.apply_progress(file_id, report)
    }

    /// Apply a progress report from a trusted, in-process storage node.
    ///
    /// Status only moves forward; a report for an earlier state leaves the
    /// record untouched. A `Complete` report for fewer bytes than declared is
    /// recorded as `InProgress`.
    pub(crate) fn apply_progress(
        &self,
        file_id: &str,
        report: ProgressReport,
    ) -> MetadataResult<FileRecord> {
        if report.bytes_stored < 0 {
            return Err(MetadataError::InvalidArgument(
                "bytes_stored must not be negative".into(),
            ));
        }

        let updated = self.store.update(file_id, |record| {
            let mut target = report.status;
            if target == UploadStatus::Complete && report.bytes_stored < record.size_bytes {
                target = UploadStatus::InProgress;
            }
            if target < record.status {
                return;
            }
            record.status = target;
            record.bytes_stored = record.bytes_stored.max(report.bytes_stored);
            if target == UploadStatus::Complete {
                record.checksum = report.checksum.clone();
            }
            record.updated_at = Utc::now();
        })?;

        let record = updated.ok_or_else(|| MetadataError::NotFound(file_id.to_string()))?;
        info!(
            file_id,
            status = ?record.status,
            bytes_stored = record.bytes_stored,
            "applied progress report"
        );
        Ok(record)
    }
}
