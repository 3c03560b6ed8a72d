//! Represents a registered upload: the master's authoritative entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a registered upload as seen by the master.
///
/// Ordered: a record only ever moves forward through these states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Registered, no bytes reported yet.
    Registered,
    /// A storage node has opened a stream for this file.
    InProgress,
    /// The storage node holds the full declared size.
    Complete,
}

impl UploadStatus {
    /// Wire name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Registered => "registered",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Complete => "complete",
        }
    }
}

/// One registered upload.
///
/// Placement and capability are fixed at registration time; only the
/// progress fields (`status`, `bytes_stored`, `checksum`, `updated_at`)
/// change afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileRecord {
    /// Unique identifier, assigned at registration.
    pub file_id: String,

    /// Client-supplied file name.
    pub filename: String,

    /// Declared size in bytes.
    pub size_bytes: i64,

    /// Address of the storage node that will receive the bytes.
    pub storage_node_address: String,

    /// Capability presented when opening the transfer stream.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,

    pub status: UploadStatus,

    /// Last durable length reported by the storage node.
    #[serde(default)]
    pub bytes_stored: i64,

    /// MD5 of the stored file, reported once the upload is complete.
    #[serde(default)]
    pub checksum: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Copy of this record with the capability token stripped, for listings.
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: String::new(),
            ..self.clone()
        }
    }
}

/// Progress report a storage node sends to the master.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub status: UploadStatus,

    /// Durable length on the storage node at the time of the report.
    pub bytes_stored: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_the_wire_format() {
        for status in [
            UploadStatus::Registered,
            UploadStatus::InProgress,
            UploadStatus::Complete,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
    }
}
