use crate::core::{KEY_LEN, POD_DEPTH};
use crate::errors::StoreError;

/// One key's read cursor: the pod slot the next read of that key will
/// return. Not necessarily the key's oldest occurrence.
#[derive(Debug, Clone)]
struct IndexEntry {
    key: [u8; KEY_LEN],
    slot: usize,
}

/// Per-pod lookup index. Lives on this process's heap, not in the
/// shared segment, so the round-robin cursor it tracks is private to
/// one attached handle. Capacity equals the pod depth: as long as
/// eviction cleanup removes the entries of keys pushed out of the pod,
/// a free entry is always available.
pub(crate) struct PodIndex {
    entries: Vec<Option<IndexEntry>>,
}

impl PodIndex {
    pub fn new() -> PodIndex {
        PodIndex {
            entries: vec![None; POD_DEPTH],
        }
    }

    pub fn get(&self, key: &[u8; KEY_LEN]) -> Option<usize> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.slot)
    }

    /// Records `slot` for a key with no entry yet; a no-op when the key
    /// already has one. A full index means eviction cleanup was skipped.
    pub fn add(&mut self, key: &[u8; KEY_LEN], slot: usize) -> Result<(), StoreError> {
        let mut free = None;
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                Some(e) if &e.key == key => return Ok(()),
                Some(_) => {}
                None => free = Some(i),
            }
        }
        match free {
            Some(i) => {
                self.entries[i] = Some(IndexEntry { key: *key, slot });
                Ok(())
            }
            None => Err(StoreError::IndexFull),
        }
    }

    /// Moves the key's cursor, adding the entry when absent.
    pub fn update(&mut self, key: &[u8; KEY_LEN], slot: usize) -> Result<(), StoreError> {
        for entry in self.entries.iter_mut().flatten() {
            if &entry.key == key {
                entry.slot = slot;
                return Ok(());
            }
        }
        self.add(key, slot)
    }

    pub fn remove(&mut self, key: &[u8; KEY_LEN]) {
        for entry in self.entries.iter_mut() {
            if let Some(e) = entry {
                if &e.key == key {
                    *entry = None;
                    return;
                }
            }
        }
    }
}
