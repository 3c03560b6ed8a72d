//! Storage-node registry of streams in flight.
//!
//! Holds one async mutex per `file_id` with an open stream, so a second
//! stream for the same file waits until the first one is closed, and the
//! ephemeral progress of every stream currently holding its lease.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::progress::UploadProgress;

#[derive(Default)]
struct Inner {
    locks: HashMap<String, Arc<AsyncMutex<()>>>,
    progress: HashMap<String, UploadProgress>,
}

#[derive(Clone, Default)]
pub struct ActiveUploads {
    inner: Arc<Mutex<Inner>>,
}

/// Exclusive right to append to one file. Released on drop.
pub struct UploadLease {
    file_id: String,
    registry: ActiveUploads,
    _guard: OwnedMutexGuard<()>,
}

impl ActiveUploads {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // progress bookkeeping stays usable after a panicking holder
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive access to `file_id`.
    pub async fn acquire(&self, file_id: &str) -> UploadLease {
        let mutex = {
            let mut inner = self.lock();
            inner
                .locks
                .entry(file_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        UploadLease {
            file_id: file_id.to_string(),
            registry: self.clone(),
            _guard: guard,
        }
    }

    /// Progress of every stream holding a lease, ordered by `file_id`.
    pub fn snapshot(&self) -> Vec<UploadProgress> {
        let mut all: Vec<UploadProgress> = self.lock().progress.values().cloned().collect();
        all.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        all
    }

    pub fn get(&self, file_id: &str) -> Option<UploadProgress> {
        self.lock().progress.get(file_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UploadLease {
    /// Start tracking progress once the resume offset is known.
    pub fn begin(&self, resume_offset: u64) {
        self.registry.lock().progress.insert(
            self.file_id.clone(),
            UploadProgress {
                file_id: self.file_id.clone(),
                resume_offset,
                bytes_received: resume_offset,
                started_at: Utc::now(),
            },
        );
    }

    pub fn record(&self, bytes_received: u64) {
        if let Some(progress) = self.registry.lock().progress.get_mut(&self.file_id) {
            progress.bytes_received = bytes_received;
        }
    }
}

impl Drop for UploadLease {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        inner.progress.remove(&self.file_id);
        // The map and this lease's guard hold one reference each; anything
        // above that is a waiter that still needs the entry.
        let idle = inner
            .locks
            .get(&self.file_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2);
        if idle {
            inner.locks.remove(&self.file_id);
        }
    }
}
