//! Per-path nodes and their caches.
//!
//! # Structure
//!
//! A [`Node`] stands for one remote path. It owns:
//!
//! - its kernel-visible entry record and its parent's record (for `..`),
//! - a mutex over [`NodeState`]: the cached attributes and, for directories,
//!   an optional [`DirEntryCache`],
//! - an atomic count of directory streams whose most recent entry is this
//!   node,
//! - a weak map of live children.
//!
//! Nodes link upward: the root holds the [`AdapterRoot`], every other node
//! holds its parent. Nothing links downward strongly, so dropping the last
//! kernel reference to a subtree frees it.
//!
//! # Locking
//!
//! The node mutex may be held across synchronous store calls. When a file
//! handle's state is needed too, the node lock is taken first. A child lock
//! is never held while taking its parent's lock.

use crate::attr::{CachedAttr, DirEntry, DirEntryCache};
use crate::error::{FuseError, FuseResult};
use crate::identity::{ROOT_INODE, file_attr, identity_of, is_dir_mode, mode_of};
use crate::root::AdapterRoot;
use fuser::FileAttr;
use objfs_core::path::join;
use objfs_core::{ErrorKind, FileInfo};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Upward link of a node.
pub enum NodeLink {
    /// The mount root owns the adapter state.
    Root(Arc<AdapterRoot>),
    Parent(Arc<Node>),
}

/// Mutable node state, guarded by the node mutex.
#[derive(Debug)]
pub struct NodeState {
    pub attr: CachedAttr,
    /// Directory listing cache. Always `None` for files.
    pub dir_cache: Option<DirEntryCache>,
}

pub struct Node {
    identity: u64,
    path: String,
    entry: DirEntry,
    parent_entry: Option<DirEntry>,
    link: NodeLink,
    state: Mutex<NodeState>,
    stream_refs: AtomicI32,
    children: Mutex<HashMap<String, Weak<Node>>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("ino", &self.entry.ino)
            .field("path", &self.path)
            .field("mode", &format_args!("{:o}", self.entry.mode))
            .field("stream_refs", &self.stream_refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates the mount root node.
    ///
    /// Its identity is `identity_of("")` but the kernel sees [`ROOT_INODE`].
    pub fn new_root(adapter: Arc<AdapterRoot>) -> Arc<Node> {
        let path = adapter.remote_root().to_string();
        assert!(!path.is_empty(), "node path must not be empty");
        let mtime = SystemTime::now();
        let attr = CachedAttr {
            size: 0,
            mtime,
            expires: adapter.clock().now(),
        };
        Arc::new(Node {
            identity: identity_of(""),
            path,
            entry: DirEntry {
                name: String::new(),
                ino: ROOT_INODE,
                mode: mode_of(true),
                size: 0,
                mtime,
            },
            parent_entry: None,
            link: NodeLink::Root(adapter),
            state: Mutex::new(NodeState {
                attr,
                dir_cache: None,
            }),
            stream_refs: AtomicI32::new(0),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a node for `name` under `parent`.
    ///
    /// With `info`, a file starts with fresh cached attributes; without, its
    /// attributes are expired and the first `getattr` stats the store.
    pub fn new_child(
        parent: &Arc<Node>,
        name: &str,
        is_dir: bool,
        info: Option<FileInfo>,
    ) -> Arc<Node> {
        let path = join(&parent.path, name);
        assert!(!path.is_empty(), "node path must not be empty");
        let adapter = parent.adapter();
        let identity = identity_of(&path);
        let attr = match info {
            Some(info) if !is_dir => CachedAttr {
                size: info.size,
                mtime: info.mtime,
                expires: adapter.expires(),
            },
            _ => CachedAttr {
                size: 0,
                mtime: if is_dir { SystemTime::now() } else { UNIX_EPOCH },
                expires: adapter.clock().now(),
            },
        };
        Arc::new(Node {
            identity,
            path,
            entry: DirEntry {
                name: name.to_string(),
                ino: identity,
                mode: mode_of(is_dir),
                size: attr.size,
                mtime: attr.mtime,
            },
            parent_entry: Some(parent.entry.clone()),
            link: NodeLink::Parent(Arc::clone(parent)),
            state: Mutex::new(NodeState {
                attr,
                dir_cache: None,
            }),
            stream_refs: AtomicI32::new(0),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// The adapter state, found by walking up to the root.
    pub fn adapter(&self) -> &Arc<AdapterRoot> {
        let mut node = self;
        loop {
            match &node.link {
                NodeLink::Root(adapter) => return adapter,
                NodeLink::Parent(parent) => node = parent.as_ref(),
            }
        }
    }

    pub fn parent(&self) -> Option<&Arc<Node>> {
        match &self.link {
            NodeLink::Root(_) => None,
            NodeLink::Parent(parent) => Some(parent),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.link, NodeLink::Root(_))
    }

    /// Kernel inode number.
    pub fn ino(&self) -> u64 {
        self.entry.ino
    }

    /// Identity derived from the path (`identity_of("")` for the root).
    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn mode(&self) -> u32 {
        self.entry.mode
    }

    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.entry.mode)
    }

    /// This node's kernel entry record.
    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    /// The parent's entry record. `None` for the root.
    pub fn parent_entry(&self) -> Option<&DirEntry> {
        self.parent_entry.as_ref()
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    /// Builds kernel attributes for this node.
    pub fn kernel_attr(&self, size: u64, mtime: SystemTime) -> FileAttr {
        let adapter = self.adapter();
        let size = if self.is_dir() { 0 } else { size };
        file_attr(self.ino(), self.mode(), size, mtime, adapter.uid(), adapter.gid())
    }

    /// Returns the cached attributes, re-stating the store if they expired.
    ///
    /// Directories never stat. The caller holds the node lock.
    pub fn current_attr(&self, state: &mut NodeState) -> FuseResult<CachedAttr> {
        if self.is_dir() {
            return Ok(state.attr);
        }
        let adapter = self.adapter();
        if adapter.is_expired(state.attr.expires) {
            let info = adapter.store().stat(adapter.ctx(), &self.path)?;
            debug!(inode = self.ino(), path = %self.path, size = info.size, "Attribute cache miss, refreshed");
            state.attr = CachedAttr {
                size: info.size,
                mtime: info.mtime,
                expires: adapter.expires(),
            };
        } else {
            trace!(inode = self.ino(), "Attribute cache hit");
        }
        Ok(state.attr)
    }

    /// Kernel attributes from the node cache.
    pub fn getattr(&self) -> FuseResult<FileAttr> {
        let mut state = self.lock();
        let attr = self.current_attr(&mut state)?;
        Ok(self.kernel_attr(attr.size, attr.mtime))
    }

    /// Records freshly known attributes. The caller holds the node lock.
    pub fn record_attr(&self, state: &mut NodeState, size: u64, mtime: SystemTime) {
        state.attr = CachedAttr {
            size,
            mtime,
            expires: self.adapter().expires(),
        };
    }

    /// Takes over `other`'s attributes if they are still fresh.
    ///
    /// Used when a listing or lookup produced a new node for a path that
    /// already has a live node.
    pub fn adopt_attr(&self, other: &Node) {
        if self.is_dir() || std::ptr::eq(self, other) {
            return;
        }
        let theirs = other.lock().attr;
        if !self.adapter().is_expired(theirs.expires) {
            self.lock().attr = theirs;
        }
    }

    // Directory stream bookkeeping

    pub fn acquire_stream_ref(&self) {
        self.stream_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    ///
    /// Panics if the count would go negative.
    pub fn release_stream_ref(&self) {
        let prev = self.stream_refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "directory stream reference count went negative for {}",
            self.path
        );
    }

    pub fn stream_refs(&self) -> i32 {
        self.stream_refs.load(Ordering::Acquire)
    }

    // Children

    /// The live child named `name`, if any.
    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        let mut children = self.children.lock();
        match children.get(name).map(Weak::upgrade) {
            Some(Some(child)) => Some(child),
            Some(None) => {
                children.remove(name);
                None
            }
            None => None,
        }
    }

    pub fn attach_child(&self, child: &Arc<Node>) {
        self.children
            .lock()
            .insert(child.name().to_string(), Arc::downgrade(child));
    }

    pub fn detach_child(&self, name: &str) {
        self.children.lock().remove(name);
    }

    // Directory entry cache

    /// Replaces the directory cache with an empty one.
    pub fn reset_dir_cache(&self) {
        let expires = self.adapter().expires();
        self.lock().dir_cache = Some(DirEntryCache::new(expires));
    }

    /// Upserts `entry` into the directory cache, if there is one.
    pub fn record_entry(&self, entry: DirEntry) {
        if let Some(cache) = self.lock().dir_cache.as_mut() {
            cache.upsert(entry);
        }
    }

    pub fn forget_entry(&self, name: &str) {
        if let Some(cache) = self.lock().dir_cache.as_mut() {
            cache.remove(name);
        }
    }

    pub fn mark_listing_complete(&self) {
        if let Some(cache) = self.lock().dir_cache.as_mut() {
            cache.mark_complete();
        }
    }

    /// A fresh cached entry for `name`.
    pub fn cached_entry(&self, name: &str) -> Option<DirEntry> {
        let adapter = self.adapter();
        let state = self.lock();
        let cache = state.dir_cache.as_ref()?;
        if adapter.is_expired(cache.expires()) {
            return None;
        }
        cache.get(name).cloned()
    }

    /// True if a fresh listing of this directory ran to the end without
    /// seeing `name`.
    pub fn listing_excludes(&self, name: &str) -> bool {
        let adapter = self.adapter();
        let state = self.lock();
        state.dir_cache.as_ref().is_some_and(|cache| {
            cache.is_complete() && !adapter.is_expired(cache.expires()) && cache.get(name).is_none()
        })
    }

    /// This node's entry with its current cached size and mtime.
    pub fn current_entry(&self) -> DirEntry {
        let attr = self.lock().attr;
        DirEntry {
            size: attr.size,
            mtime: attr.mtime,
            ..self.entry.clone()
        }
    }

    /// Pushes this node's cached attributes into the parent's directory cache.
    ///
    /// Takes the child lock, releases it, then takes the parent lock.
    pub fn publish_to_parent(&self) {
        let entry = self.current_entry();
        if let Some(parent) = self.parent() {
            parent.record_entry(entry);
        }
    }

    /// Resolves `name` in this directory.
    ///
    /// A child that is the most recent entry of a live directory stream is
    /// reused. Otherwise a fresh directory cache answers, either with the
    /// entry or, after a complete listing, with its absence. As a last
    /// resort the store is listed recursively at `path/name`: an exact
    /// directory entry or anything below `path/name/` makes a directory, an
    /// exact file entry makes a file. The returned node is not yet attached
    /// to the node table.
    pub fn lookup(self: &Arc<Self>, name: &str) -> FuseResult<Arc<Node>> {
        validate_name(name)?;
        if !self.is_dir() {
            return Err(FuseError::NotDirectory);
        }

        if let Some(child) = self.child(name)
            && child.stream_refs() > 0
        {
            trace!(parent = self.ino(), name, "Lookup reused directory stream entry");
            return Ok(child);
        }

        if let Some(entry) = self.cached_entry(name) {
            debug!(parent = self.ino(), name, "Directory cache hit");
            let is_dir = is_dir_mode(entry.mode);
            let info = FileInfo {
                size: entry.size,
                mtime: entry.mtime,
            };
            return Ok(Node::new_child(self, name, is_dir, Some(info)));
        }

        let child_path = join(&self.path, name);
        if self.listing_excludes(name) {
            debug!(parent = self.ino(), name, "Complete directory cache has no such entry");
            return Err(FuseError::NotFound(child_path));
        }

        let adapter = self.adapter();
        let descendants = format!("{child_path}/");
        debug!(parent = self.ino(), path = %child_path, "Directory cache miss, listing store");

        let listing = match adapter.store().list(adapter.ctx(), &child_path, true) {
            Ok(listing) => listing,
            Err(e) if is_no_match(e.kind()) => return Err(FuseError::NotFound(child_path)),
            Err(e) => return Err(e.into()),
        };

        let mut is_dir = false;
        let mut file: Option<Option<FileInfo>> = None;
        for item in listing {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) if is_no_match(e.kind()) => break,
                Err(e) => return Err(e.into()),
            };
            if entry.path == child_path {
                if entry.is_dir {
                    is_dir = true;
                    break;
                }
                file = Some(entry.info);
            } else if entry.path.starts_with(&descendants) {
                is_dir = true;
                break;
            }
        }

        if is_dir {
            return Ok(Node::new_child(self, name, true, None));
        }
        match file {
            Some(Some(info)) => Ok(Node::new_child(self, name, false, Some(info))),
            Some(None) => {
                let info = adapter.store().stat(adapter.ctx(), &child_path)?;
                Ok(Node::new_child(self, name, false, Some(info)))
            }
            None => Err(FuseError::NotFound(child_path)),
        }
    }

    /// Truncates the remote object to zero bytes by committing an empty object.
    pub fn truncate_remote(&self) -> FuseResult<()> {
        let adapter = self.adapter();
        {
            let mut state = self.lock();
            let writer = adapter.store().create(adapter.ctx(), &self.path)?;
            writer.close(adapter.ctx())?;
            self.record_attr(&mut state, 0, SystemTime::now());
        }
        debug!(inode = self.ino(), path = %self.path, "Remote object truncated");
        self.publish_to_parent();
        Ok(())
    }
}

/// Listing errors that mean "nothing there" during lookup.
fn is_no_match(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::NotExist | ErrorKind::NotAllowed)
}

/// Rejects names the store cannot address.
pub fn validate_name(name: &str) -> FuseResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(FuseError::InvalidName(name.to_string()));
    }
    Ok(())
}
