//! Core data models for the upload master and storage nodes.
//!
//! A `FileRecord` is what the master knows about an upload, a `Chunk` is
//! what travels on the transfer stream, and an `UploadProgress` is the
//! storage node's ephemeral view of a stream in flight. All of them
//! serialize as JSON via `serde`.

pub mod chunk;
pub mod file_record;
pub mod progress;
