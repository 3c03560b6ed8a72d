//! Business logic behind both roles.
//!
//! The master owns [`metadata_service`] over an in-memory [`upload_store`];
//! a storage node owns [`transfer_service`], which appends chunk streams to
//! local files and reports through an [`observer`].

pub mod active_uploads;
pub mod channel;
pub mod metadata_service;
pub mod observer;
pub mod token;
pub mod transfer_service;
pub mod upload_store;
