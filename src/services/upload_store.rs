//! In-process table of registered uploads.
//!
//! Every read and write goes through one mutex. Critical sections are kept
//! to id allocation plus a map operation and never span an `.await`.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Mutex, MutexGuard},
};

use thiserror::Error;
use uuid::Uuid;

use crate::models::file_record::FileRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Default)]
pub struct UploadStore {
    records: Mutex<HashMap<String, FileRecord>>,
}

impl UploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, FileRecord>>> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Allocate a fresh `file_id`, build the record for it and insert it.
    ///
    /// `build` runs under the guard, so it must not block. An id already
    /// present in the table is never handed out again.
    pub fn insert_new<F>(&self, build: F) -> StoreResult<FileRecord>
    where
        F: FnOnce(String) -> FileRecord,
    {
        let mut records = self.lock()?;
        loop {
            if let Entry::Vacant(slot) = records.entry(next_file_id()) {
                let record = build(slot.key().clone());
                return Ok(slot.insert(record).clone());
            }
        }
    }

    pub fn get(&self, file_id: &str) -> StoreResult<Option<FileRecord>> {
        Ok(self.lock()?.get(file_id).cloned())
    }

    /// Apply `update` to the record for `file_id`, returning the result.
    pub fn update<F>(&self, file_id: &str, update: F) -> StoreResult<Option<FileRecord>>
    where
        F: FnOnce(&mut FileRecord),
    {
        let mut records = self.lock()?;
        Ok(records.get_mut(file_id).map(|record| {
            update(record);
            record.clone()
        }))
    }

    /// Consistent copy of every record, oldest first.
    pub fn snapshot(&self) -> StoreResult<Vec<FileRecord>> {
        let mut all: Vec<FileRecord> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(all)
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn next_file_id() -> String {
    format!("file_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_record::UploadStatus;
    use chrono::Utc;

    fn record(file_id: String) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            file_id,
            filename: "a.bin".into(),
            size_bytes: 1,
            storage_node_address: "localhost:50052".into(),
            auth_token: "t".into(),
            status: UploadStatus::Registered,
            bytes_stored: 0,
            checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_assigns_ids_and_get_finds_them() {
        let store = UploadStore::new();
        let a = store.insert_new(record).unwrap();
        let b = store.insert_new(record).unwrap();
        assert_ne!(a.file_id, b.file_id);
        assert!(a.file_id.starts_with("file_"));
        assert_eq!(store.get(&a.file_id).unwrap(), Some(a));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn update_missing_record_is_none() {
        let store = UploadStore::new();
        let res = store
            .update("file_missing", |r| r.bytes_stored = 10)
            .unwrap();
        assert!(res.is_none());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn snapshot_is_ordered_by_creation() {
        let store = UploadStore::new();
        let first = store.insert_new(record).unwrap();
        let second = store.insert_new(record).unwrap();
        let ids: Vec<String> = store
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.file_id)
            .collect();
        assert_eq!(ids.len(), 2);
        if first.created_at < second.created_at {
            assert_eq!(ids, vec![first.file_id, second.file_id]);
        }
    }
}
