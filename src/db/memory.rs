use super::{Entry, KeyValueStore, KeyValueWriter};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Ordered in-memory store. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer whose records become visible on `close`.
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            store: self.clone(),
            pending: Vec::new(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.entries.read().map_err(|_| poisoned())
    }
}

fn poisoned() -> Error {
    Error::Io(std::io::Error::other("memory store lock poisoned"))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>> {
        let entries = self.read()?;
        let start = match after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        Ok(entries
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

pub struct MemoryWriter {
    store: MemoryStore,
    pending: Vec<Entry>,
}

impl KeyValueWriter for MemoryWriter {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn close(self) -> Result<()> {
        let mut entries = self.store.entries.write().map_err(|_| poisoned())?;
        for (key, value) in self.pending {
            entries.insert(key, value);
        }
        Ok(())
    }
}
