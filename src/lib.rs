//! stowage: a resumable upload master and storage node.
//!
//! The master registers uploads and hands out a storage node address plus a
//! capability token; the storage node accepts a chunk stream over a
//! WebSocket and resumes from whatever is already durable on disk.

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
