//! Cached attributes and directory entry caches.

use crate::clock::Timestamp;
use std::collections::HashMap;
use std::time::SystemTime;

/// Size and mtime of a node, valid until `expires`.
///
/// An expired value is still a reasonable answer for the kernel; callers
/// that need the current size re-stat.
#[derive(Debug, Clone, Copy)]
pub struct CachedAttr {
    pub size: u64,
    pub mtime: SystemTime,
    pub expires: Timestamp,
}

/// A kernel-visible directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Directory entries in listing order with a name index.
#[derive(Debug, Clone)]
pub struct DirEntryCache {
    entries: Vec<DirEntry>,
    index: HashMap<String, usize>,
    expires: Timestamp,
    complete: bool,
}

impl DirEntryCache {
    pub fn new(expires: Timestamp) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            expires,
            complete: false,
        }
    }

    /// Appends a new entry.
    ///
    /// # Panics
    ///
    /// Panics if an entry with the same name is already present.
    pub fn insert(&mut self, entry: DirEntry) {
        assert!(
            !self.index.contains_key(&entry.name),
            "duplicate directory entry {:?}",
            entry.name
        );
        self.index.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Replaces the entry with the same name in place, or appends it.
    pub fn upsert(&mut self, entry: DirEntry) {
        match self.index.get(&entry.name) {
            Some(&i) => self.entries[i] = entry,
            None => self.insert(entry),
        }
    }

    /// Removes an entry, keeping the order of the rest.
    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        let i = self.index.remove(name)?;
        let removed = self.entries.remove(i);
        for e in &self.entries[i..] {
            if let Some(slot) = self.index.get_mut(&e.name) {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn expires(&self) -> Timestamp {
        self.expires
    }

    /// True once a listing has been read to the end without error.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}
