//! Lazy per-open directory enumeration.
//!
//! A [`DirStream`] yields `..` (except at the mount root), `.`, then one
//! entry per child in remote listing order. Along the way it:
//!
//! - skips directory markers (keys equal to the directory prefix) and
//!   anything that is not an immediate child,
//! - lets a directory win over a file of the same name. A file is held
//!   back until the listing has moved past the key where its directory
//!   would sort (`name/`), and a directory arriving for a name already
//!   produced as a file replaces it in the caches,
//! - records each child in the directory's child map and entry cache,
//! - holds a stream reference on the most recently produced child, which is
//!   what lets `lookup` of that name skip the store.
//!
//! Children are not registered in the node table: the kernel holds no
//! lookup reference on a plain `readdir` entry, and `lookup` or
//! `readdirplus` register them when it does.
//!
//! Produced entries are kept in a per-open buffer so the kernel can revisit
//! any `readdir` offset within one open.

use crate::error::{FuseError, FuseResult};
use crate::inode::NodeTable;
use crate::node::Node;
use objfs_core::path::{child_name, dir_prefix};
use objfs_core::{ErrorKind, ListEntry, Listing, StoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// One entry served to the kernel.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
    /// The child node. `None` for `.` and `..`.
    pub node: Option<Arc<Node>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Parent,
    Current,
    Entries,
    Done,
}

pub struct DirStream {
    dir: Arc<Node>,
    table: Arc<NodeTable>,
    prefix: String,
    phase: Phase,
    listing: Option<Listing>,
    /// Accepted children not yet produced, in listing order.
    held: VecDeque<(String, ListEntry)>,
    /// Path of the most recent child entry the listing returned.
    last_key: Option<String>,
    /// A listing error reported once the held entries are drained.
    failure: Option<StoreError>,
    /// Produced names and whether each is a directory.
    produced: HashMap<String, bool>,
    previous: Option<Arc<Node>>,
    buffer: Vec<StreamEntry>,
}

impl std::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStream")
            .field("dir", &self.dir.path())
            .field("phase", &self.phase)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl DirStream {
    /// Starts a non-recursive listing of `dir` and resets its entry cache.
    pub fn open(dir: Arc<Node>, table: Arc<NodeTable>) -> FuseResult<Self> {
        if !dir.is_dir() {
            return Err(FuseError::NotDirectory);
        }
        let adapter = dir.adapter();
        let prefix = dir_prefix(dir.path());
        let listing = adapter
            .store()
            .list(adapter.ctx(), &prefix, false)
            .map_err(|e| listing_error(&dir, e))?;
        dir.reset_dir_cache();
        debug!(inode = dir.ino(), path = %prefix, "Directory stream opened");

        let phase = if dir.is_root() { Phase::Current } else { Phase::Parent };
        Ok(Self {
            dir,
            table,
            prefix,
            phase,
            listing: Some(listing),
            held: VecDeque::new(),
            last_key: None,
            failure: None,
            produced: HashMap::new(),
            previous: None,
            buffer: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Arc<Node> {
        &self.dir
    }

    /// Returns the entry at `index`, pulling from the listing as needed.
    ///
    /// `Ok(None)` once the listing is exhausted.
    pub fn entry_at(&mut self, index: usize) -> FuseResult<Option<&StreamEntry>> {
        while self.buffer.len() <= index {
            match self.next_entry()? {
                Some(entry) => self.buffer.push(entry),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.get(index))
    }

    /// Produces the next entry.
    pub fn next_entry(&mut self) -> FuseResult<Option<StreamEntry>> {
        loop {
            match self.phase {
                Phase::Parent => {
                    self.phase = Phase::Current;
                    if let Some(parent) = self.dir.parent_entry() {
                        return Ok(Some(StreamEntry {
                            name: "..".to_string(),
                            ino: parent.ino,
                            mode: parent.mode,
                            node: None,
                        }));
                    }
                }
                Phase::Current => {
                    self.phase = Phase::Entries;
                    return Ok(Some(StreamEntry {
                        name: ".".to_string(),
                        ino: self.dir.ino(),
                        mode: self.dir.mode(),
                        node: None,
                    }));
                }
                Phase::Entries => return self.next_remote(),
                Phase::Done => return Ok(None),
            }
        }
    }

    fn next_remote(&mut self) -> FuseResult<Option<StreamEntry>> {
        loop {
            if let Some((name, entry)) = self.take_settled() {
                return Ok(Some(self.produce(name, &entry)));
            }
            let Some(listing) = self.listing.as_mut() else {
                if let Some((name, entry)) = self.held.pop_front() {
                    return Ok(Some(self.produce(name, &entry)));
                }
                if let Some(e) = self.failure.take() {
                    self.phase = Phase::Done;
                    return Err(listing_error(&self.dir, e));
                }
                self.finish();
                return Ok(None);
            };
            match listing.next() {
                Some(Ok(entry)) => self.accept(entry),
                Some(Err(e)) => {
                    self.listing = None;
                    self.failure = Some(e);
                }
                None => self.listing = None,
            }
        }
    }

    /// Queues a listed entry, or folds it into one already seen.
    fn accept(&mut self, entry: ListEntry) {
        let Some(name) = child_name(&self.prefix, &entry.path).map(str::to_string) else {
            trace!(path = %entry.path, "Skipping marker or non-child entry");
            return;
        };
        self.last_key = Some(entry.path.clone());

        let held = self.held.iter().position(|(n, _)| *n == name);
        if entry.is_dir {
            if let Some(i) = held {
                if !self.held[i].1.is_dir {
                    debug!(name = %name, "Directory shadows file of the same name");
                    self.held[i].1 = entry;
                }
            } else if let Some(&was_dir) = self.produced.get(&name) {
                if !was_dir {
                    self.upgrade(&name);
                }
            } else {
                self.held.push_back((name, entry));
            }
        } else if held.is_some() || self.produced.contains_key(&name) {
            trace!(name = %name, "Suppressing entry with an already seen name");
        } else {
            self.held.push_back((name, entry));
        }
    }

    /// Pops the first held entry if no later key can still shadow it.
    ///
    /// A held file is settled once the listing has returned a key past
    /// `prefix/name/`, since a key-ordered listing can no longer return a
    /// same-named directory.
    fn take_settled(&mut self) -> Option<(String, ListEntry)> {
        let (name, entry) = self.held.front()?;
        if !entry.is_dir {
            let dir_key = format!("{}{name}/", self.prefix);
            let passed = self
                .last_key
                .as_deref()
                .is_some_and(|key| key > dir_key.as_str() && !key.starts_with(&dir_key));
            if !passed {
                return None;
            }
        }
        self.held.pop_front()
    }

    fn produce(&mut self, name: String, entry: &ListEntry) -> StreamEntry {
        let info = if entry.is_dir { None } else { entry.info };
        let child = self
            .table
            .share(Node::new_child(&self.dir, &name, entry.is_dir, info));
        self.dir.attach_child(&child);
        self.dir.record_entry(child.current_entry());

        child.acquire_stream_ref();
        if let Some(previous) = self.previous.replace(Arc::clone(&child)) {
            previous.release_stream_ref();
        }
        self.produced.insert(name.clone(), child.is_dir());
        trace!(parent = self.dir.ino(), name = %name, inode = child.ino(), "Directory entry produced");

        StreamEntry {
            name,
            ino: child.ino(),
            mode: child.mode(),
            node: Some(child),
        }
    }

    /// Turns an already produced file entry into a directory.
    ///
    /// Only reachable when the store does not list in key order.
    fn upgrade(&mut self, name: &str) {
        debug!(name, "Directory shadows already produced file");
        let child = self
            .table
            .share(Node::new_child(&self.dir, name, true, None));
        self.dir.attach_child(&child);
        self.dir.record_entry(child.current_entry());
        self.produced.insert(name.to_string(), true);

        if self.previous.as_ref().is_some_and(|p| p.name() == name) {
            child.acquire_stream_ref();
            if let Some(previous) = self.previous.replace(Arc::clone(&child)) {
                previous.release_stream_ref();
            }
        }
        if let Some(slot) = self.buffer.iter_mut().find(|e| e.name == name) {
            slot.mode = child.mode();
            slot.node = Some(child);
        }
    }

    fn finish(&mut self) {
        if self.phase != Phase::Done {
            self.phase = Phase::Done;
            self.listing = None;
            self.dir.mark_listing_complete();
            debug!(inode = self.dir.ino(), entries = self.produced.len(), "Directory listing complete");
        }
    }

    /// Drops the reference on the most recent entry. Idempotent.
    pub fn close(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.release_stream_ref();
        }
        self.listing = None;
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reports any listing failure as a cancellation once the mount's context is cancelled.
fn listing_error(dir: &Node, e: StoreError) -> FuseError {
    if dir.adapter().ctx().is_cancelled() && e.kind() != ErrorKind::Canceled {
        return StoreError::new(ErrorKind::Canceled, "list", e.path()).into();
    }
    e.into()
}
