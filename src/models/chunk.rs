//! The message unit of the transfer stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One message on a chunk stream.
///
/// Clients send chunks carrying payload; the storage node answers with
/// status chunks (`data` empty) whose `offset` is its durable length.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    pub file_id: String,

    /// Byte position this chunk's data begins at, as claimed by the sender.
    #[serde(default)]
    pub offset: u64,

    /// Sequence number, informational only.
    #[serde(default)]
    pub chunk_index: u64,

    /// Raw payload, base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub data: Bytes,
}

impl Chunk {
    /// A data-less chunk reporting `offset` for `file_id`.
    pub fn status(file_id: impl Into<String>, offset: u64) -> Self {
        Self {
            file_id: file_id.into(),
            offset,
            chunk_index: 0,
            data: Bytes::new(),
        }
    }

    pub fn is_status(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset just past the last byte this chunk carries.
    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.data.len() as u64)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
