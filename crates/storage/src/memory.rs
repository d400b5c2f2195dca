use std::collections::HashMap;

use recordcache_core::ids::ResourceKey;

use crate::error::StorageError;
use crate::traits::{RecordStore, ResourceRecord};

/// Process-local record arena. Records reference each other only through
/// keys, so cycles never keep memory alive.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<ResourceKey, ResourceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, key: ResourceKey) -> Option<&ResourceRecord> {
        self.records.get(&key)
    }

    fn get_mut(&mut self, key: ResourceKey) -> Option<&mut ResourceRecord> {
        self.records.get_mut(&key)
    }

    fn ensure(&mut self, key: ResourceKey) -> &mut ResourceRecord {
        self.records
            .entry(key)
            .or_insert_with(|| ResourceRecord::new(key))
    }

    fn remove(&mut self, key: ResourceKey) -> Option<ResourceRecord> {
        self.records.remove(&key)
    }

    fn contains(&self, key: ResourceKey) -> bool {
        self.records.contains_key(&key)
    }

    fn rekey(&mut self, from: ResourceKey, to: ResourceKey) -> Result<(), StorageError> {
        if self.records.contains_key(&to) {
            return Err(StorageError::RecordExists(to));
        }
        let mut record = self
            .records
            .remove(&from)
            .ok_or(StorageError::UnknownKey(from))?;
        record.key = to;
        self.records.insert(to, record);
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
