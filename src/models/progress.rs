//! Storage-node local view of an in-flight transfer.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Progress of one active stream. Lives only as long as the stream.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UploadProgress {
    pub file_id: String,

    /// Durable length when the stream opened.
    pub resume_offset: u64,

    /// Durable length right now.
    pub bytes_received: u64,

    pub started_at: DateTime<Utc>,
}
