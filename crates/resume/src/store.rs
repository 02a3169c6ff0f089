use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{ResumableTransferRecord, StoreError};

/// Resumable transfer records, cached in memory and persisted to a JSON
/// file after every change.
pub struct RecordStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<String, ResumableTransferRecord>>,
}

impl RecordStore {
    /// Opens the store at `path`, loading existing records. A missing file
    /// is an empty store.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = load_records(&path)?;
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, transfer_id: &str) -> Option<ResumableTransferRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transfer_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ResumableTransferRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, record: ResumableTransferRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.transfer_id.clone(), record);
        self.persist()
    }

    /// Applies `f` to an existing record. Returns `false` if there was
    /// none.
    pub fn update<F>(&self, transfer_id: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut ResumableTransferRecord),
    {
        {
            let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(transfer_id) {
                Some(record) => {
                    f(record);
                    record.updated_at = Utc::now();
                }
                None => return Ok(false),
            }
        }
        self.persist()?;
        Ok(true)
    }

    pub fn remove(&self, transfer_id: &str) -> Result<Option<ResumableTransferRecord>, StoreError> {
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transfer_id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Drops records expired at `now` and returns them.
    pub fn prune_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResumableTransferRecord>, StoreError> {
        let expired: Vec<_> = {
            let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = map
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.transfer_id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned expired transfer records");
            self.persist()?;
        }
        Ok(expired)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        debug!("persisted {} record(s) to {:?}", map.len(), path);
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, ResumableTransferRecord>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let raw: HashMap<String, ResumableTransferRecord> = serde_json::from_str(&data)?;
    let records: HashMap<_, _> = raw
        .into_iter()
        .filter_map(|(id, record)| match record.validated() {
            Some(record) if record.transfer_id == id => Some((id, record)),
            _ => {
                warn!(transfer = %id, "dropping inconsistent transfer record");
                None
            }
        })
        .collect();
    debug!("loaded {} record(s) from {:?}", records.len(), path);
    Ok(records)
}
