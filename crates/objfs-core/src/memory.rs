//! In-memory object store with S3-like semantics.
//!
//! Keys live in one flat ordered map. Directories are implied by `/` in keys;
//! a key ending in `/` is a zero-length directory marker. A file and a
//! directory can share a name (`a/x` and `a/x/y`), which the adapter has to
//! resolve.
//!
//! The store also records per-operation call counts and can be told to fail
//! the next call of an operation, which the adapter tests rely on.

use crate::context::StoreContext;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::path::dir_prefix;
use crate::store::{FileInfo, ListEntry, Listing, ObjectStore, ReadStream, WriteStream};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Store operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Stat,
    Open,
    Create,
    /// One `write` call on a writer created by `create`.
    Write,
    /// Committing a writer created by `create`.
    Commit,
    List,
    Remove,
}

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    mtime: SystemTime,
}

impl MemObject {
    fn info(&self) -> FileInfo {
        FileInfo {
            size: self.data.len() as u64,
            mtime: self.mtime,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    objects: RwLock<BTreeMap<String, MemObject>>,
    faults: Mutex<HashMap<StoreOp, ErrorKind>>,
    counts: Mutex<HashMap<StoreOp, u64>>,
}

impl Shared {
    fn begin(&self, op: StoreOp, ctx: &StoreContext, name: &'static str, path: &str) -> StoreResult<()> {
        *self.counts.lock().entry(op).or_insert(0) += 1;
        ctx.check(name, path)?;
        if let Some(kind) = self.faults.lock().remove(&op) {
            debug!(?op, path, %kind, "Injected store fault");
            return Err(StoreError::new(kind, name, path));
        }
        Ok(())
    }
}

/// A thread-safe in-memory object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `key`, replacing any previous object.
    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.shared.objects.write().insert(
            key.into(),
            MemObject {
                data: data.into(),
                mtime: SystemTime::now(),
            },
        );
    }

    /// Stores a zero-length directory marker for `dir`.
    pub fn put_marker(&self, dir: &str) {
        self.put(dir_prefix(dir), Bytes::new());
    }

    /// Returns the content stored under `key`.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.shared.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.objects.read().contains_key(key)
    }

    /// Sorted list of every key in the store.
    pub fn keys(&self) -> Vec<String> {
        self.shared.objects.read().keys().cloned().collect()
    }

    /// Makes the next call of `op` fail with `kind`.
    pub fn fail_next(&self, op: StoreOp, kind: ErrorKind) {
        self.shared.faults.lock().insert(op, kind);
    }

    /// Number of times `op` has been called.
    pub fn op_count(&self, op: StoreOp) -> u64 {
        self.shared.counts.lock().get(&op).copied().unwrap_or(0)
    }

    fn list_children(&self, path: &str) -> VecDeque<ListEntry> {
        let prefix = dir_prefix(path);
        let objects = self.shared.objects.read();
        let mut out = VecDeque::new();
        if path != prefix
            && let Some(obj) = objects.get(path)
        {
            out.push_back(ListEntry::file(path, obj.info()));
        }

        // Keyed by the listed path: delimiter listings come back in plain
        // key order, so `x` and `x.txt` both precede `x/`.
        let mut children: BTreeMap<String, Option<FileInfo>> = BTreeMap::new();
        for (key, obj) in objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            if rest.is_empty() {
                out.push_back(ListEntry::file(key.clone(), obj.info()));
                continue;
            }
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.entry(format!("{prefix}{dir}/")).or_insert(None);
                }
                None => {
                    children.insert(key.clone(), Some(obj.info()));
                }
            }
        }
        for (path, info) in children {
            match info {
                Some(info) => out.push_back(ListEntry::file(path, info)),
                None => out.push_back(ListEntry::dir(path)),
            }
        }
        out
    }

    fn list_recursive(&self, path: &str) -> VecDeque<ListEntry> {
        let objects = self.shared.objects.read();
        let prefix = dir_prefix(path);
        let mut out = VecDeque::new();
        if path != prefix
            && let Some(obj) = objects.get(path)
        {
            out.push_back(ListEntry::file(path, obj.info()));
        }
        for (key, obj) in objects.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let mut entry = ListEntry::file(key.clone(), obj.info());
            entry.is_dir = key.ends_with('/');
            out.push_back(entry);
        }
        out
    }
}

struct MemListing {
    entries: VecDeque<ListEntry>,
    ctx: StoreContext,
    path: String,
    failed: bool,
}

impl Iterator for MemListing {
    type Item = StoreResult<ListEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.entries.pop_front()?;
        if let Err(e) = self.ctx.check("list", &self.path) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(entry))
    }
}

impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn stat(&self, ctx: &StoreContext, path: &str) -> StoreResult<FileInfo> {
        self.shared.begin(StoreOp::Stat, ctx, "stat", path)?;
        self.shared
            .objects
            .read()
            .get(path)
            .map(MemObject::info)
            .ok_or_else(|| StoreError::new(ErrorKind::NotExist, "stat", path))
    }

    fn open(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn ReadStream>> {
        self.shared.begin(StoreOp::Open, ctx, "open", path)?;
        let data = self
            .get(path)
            .ok_or_else(|| StoreError::new(ErrorKind::NotExist, "open", path))?;
        Ok(Box::new(MemReader {
            cursor: Cursor::new(data),
        }))
    }

    fn create(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn WriteStream>> {
        self.shared.begin(StoreOp::Create, ctx, "create", path)?;
        Ok(Box::new(MemWriter {
            store: self.clone(),
            ctx: ctx.clone(),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn list(&self, ctx: &StoreContext, path: &str, recursive: bool) -> StoreResult<Listing> {
        self.shared.begin(StoreOp::List, ctx, "list", path)?;
        let entries = if recursive {
            self.list_recursive(path)
        } else {
            self.list_children(path)
        };
        Ok(Box::new(MemListing {
            entries,
            ctx: ctx.clone(),
            path: path.to_string(),
            failed: false,
        }))
    }

    fn remove(&self, ctx: &StoreContext, path: &str) -> StoreResult<()> {
        self.shared.begin(StoreOp::Remove, ctx, "remove", path)?;
        self.shared
            .objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::new(ErrorKind::NotExist, "remove", path))
    }
}

struct MemReader {
    cursor: Cursor<Bytes>,
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl ReadStream for MemReader {
    fn close(self: Box<Self>, _ctx: &StoreContext) -> StoreResult<()> {
        Ok(())
    }
}

struct MemWriter {
    store: MemoryStore,
    ctx: StoreContext,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.store
            .shared
            .begin(StoreOp::Write, &self.ctx, "write", &self.path)
            .map_err(io::Error::other)?;
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteStream for MemWriter {
    fn close(self: Box<Self>, ctx: &StoreContext) -> StoreResult<()> {
        self.store
            .shared
            .begin(StoreOp::Commit, ctx, "create", &self.path)?;
        let MemWriter { store, path, buf, .. } = *self;
        store.put(path, buf);
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}
