pub mod health_handlers;
pub mod metadata_handlers;
pub mod transfer_handlers;
