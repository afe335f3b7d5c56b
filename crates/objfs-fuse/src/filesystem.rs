//! The FUSE filesystem.
//!
//! [`Adapter`] implements every callback as a plain method returning
//! [`FuseResult`], which keeps the semantics testable without a kernel
//! mount. [`ObjectFs`] is the `fuser::Filesystem` glue: it converts names,
//! hands each call to the [`WorkerPool`] and turns results into replies.

use crate::clock::Invalidator;
use crate::config::MountConfig;
use crate::dirstream::DirStream;
use crate::dispatch::WorkerPool;
use crate::error::{FuseError, FuseResult};
use crate::handles::{FileHandle, HandleTable};
use crate::identity::{file_attr, file_type, identity_of};
use crate::inode::NodeTable;
use crate::node::{Node, validate_name};
use crate::root::AdapterRoot;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use objfs_core::path::join;
use objfs_core::{FileInfo, ObjectStore};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace};

/// Synthetic filesystem statistics. Object stores have no meaningful
/// capacity, so the values are simply large.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

const STATFS: StatFs = StatFs {
    blocks: 1 << 40,
    bfree: 1 << 40,
    bavail: 1 << 40,
    files: 1 << 32,
    ffree: 1 << 32,
    bsize: 4096,
    namelen: 255,
    frsize: 4096,
};

/// Adapter state for one mount. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Adapter {
    root: Arc<AdapterRoot>,
    nodes: Arc<NodeTable>,
    files: Arc<HandleTable<Arc<FileHandle>>>,
    dirs: Arc<HandleTable<Arc<Mutex<DirStream>>>>,
}

impl Adapter {
    /// Creates the adapter for `remote_root` in `store`.
    ///
    /// # Errors
    ///
    /// Fails if the scratch directory cannot be created.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        remote_root: &str,
        config: MountConfig,
    ) -> FuseResult<Self> {
        let root = Arc::new(AdapterRoot::new(store, remote_root, config)?);
        let root_node = Node::new_root(Arc::clone(&root));
        Ok(Self {
            root,
            nodes: Arc::new(NodeTable::new(root_node)),
            files: Arc::new(HandleTable::new()),
            dirs: Arc::new(HandleTable::new()),
        })
    }

    pub fn config(&self) -> &MountConfig {
        self.root.config()
    }

    pub fn store_name(&self) -> &str {
        self.root.store().name()
    }

    /// Handle for expiring every node-level cache at once.
    pub fn invalidator(&self) -> Invalidator {
        self.root.invalidator()
    }

    /// Cancels the ambient context. In-flight and later store calls fail
    /// with `EINTR`.
    pub fn cancel(&self) {
        self.root.ctx().cancel();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    fn file(&self, fh: u64) -> FuseResult<Arc<FileHandle>> {
        self.files.get(fh).ok_or(FuseError::InvalidHandle(fh))
    }

    fn dir_stream(&self, fh: u64) -> FuseResult<Arc<Mutex<DirStream>>> {
        self.dirs.get(fh).ok_or(FuseError::InvalidHandle(fh))
    }

    fn directory(&self, ino: u64) -> FuseResult<Arc<Node>> {
        let dir = self.nodes.get(ino)?;
        if !dir.is_dir() {
            return Err(FuseError::NotDirectory);
        }
        Ok(dir)
    }

    /// Registers a child the kernel now holds a lookup reference on.
    fn register(&self, dir: &Node, child: Arc<Node>) -> Arc<Node> {
        let child = self.nodes.attach(child);
        dir.attach_child(&child);
        child
    }

    /// Resolves `name` under `parent` and counts one kernel lookup.
    pub fn lookup(&self, parent: u64, name: &str) -> FuseResult<FileAttr> {
        let dir = self.nodes.get(parent)?;
        let child = self.register(&dir, dir.lookup(name)?);
        match child.getattr() {
            Ok(attr) => {
                dir.record_entry(child.current_entry());
                Ok(attr)
            }
            Err(e) => {
                self.nodes.forget(child.ino(), 1);
                Err(e)
            }
        }
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    /// Attributes of `ino`, through the open handle `fh` when given.
    pub fn getattr(&self, ino: u64, fh: Option<u64>) -> FuseResult<FileAttr> {
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh))
            && handle.node().ino() == ino
        {
            return handle.attr();
        }
        self.nodes.get(ino)?.getattr()
    }

    /// Applies a size change. Other attribute changes are ignored.
    ///
    /// Without a handle only truncation to zero is supported.
    pub fn setattr(&self, ino: u64, fh: Option<u64>, size: Option<u64>) -> FuseResult<FileAttr> {
        let node = self.nodes.get(ino)?;
        let handle = fh.and_then(|fh| self.files.get(fh));
        match (size, handle) {
            (Some(_), _) if node.is_dir() => Err(FuseError::IsDirectory),
            (Some(size), Some(handle)) => {
                handle.set_size(size)?;
                handle.attr()
            }
            (Some(0), None) => {
                node.truncate_remote()?;
                node.getattr()
            }
            (Some(_), None) => Err(FuseError::NotSupported("truncate to nonzero size without a handle")),
            (None, Some(handle)) => handle.attr(),
            (None, None) => node.getattr(),
        }
    }

    /// Opens `ino` and returns the new file handle ID.
    pub fn open(&self, ino: u64, flags: i32) -> FuseResult<u64> {
        let node = self.nodes.get(ino)?;
        let handle = FileHandle::open(node, flags)?;
        let fh = self.files.insert(Arc::new(handle));
        debug!(inode = ino, fh, flags = format_args!("{flags:#o}"), "File opened");
        Ok(fh)
    }

    /// Creates `name` under `parent`, counting one kernel lookup.
    ///
    /// Nothing reaches the store, or the parent's entry cache, until the
    /// handle is flushed.
    pub fn create(&self, parent: u64, name: &str, flags: i32) -> FuseResult<(FileAttr, u64)> {
        validate_name(name)?;
        let dir = self.directory(parent)?;
        let info = FileInfo {
            size: 0,
            mtime: SystemTime::now(),
        };
        let child = self.register(&dir, Node::new_child(&dir, name, false, Some(info)));
        let attr = child.getattr()?;
        let fh = self.files.insert(Arc::new(FileHandle::create(child, flags)));
        debug!(parent, name, fh, "File created");
        Ok((attr, fh))
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> FuseResult<Vec<u8>> {
        self.file(fh)?.read(to_offset(offset)?, size)
    }

    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> FuseResult<u32> {
        self.file(fh)?.write(to_offset(offset)?, data)
    }

    pub fn flush(&self, fh: u64) -> FuseResult<()> {
        self.file(fh)?.flush()
    }

    pub fn fsync(&self, fh: u64) -> FuseResult<()> {
        self.file(fh)?.fsync()
    }

    /// Drops the handle, flushing it first if it was never flushed.
    pub fn release(&self, fh: u64) -> FuseResult<()> {
        let handle = self.files.remove(fh).ok_or(FuseError::InvalidHandle(fh))?;
        handle.release();
        Ok(())
    }

    pub fn lseek(&self, fh: u64, offset: i64, whence: i32) -> FuseResult<i64> {
        self.file(fh)?.lseek(offset, whence)
    }

    /// Starts a directory stream and returns its handle ID.
    pub fn opendir(&self, ino: u64) -> FuseResult<u64> {
        let dir = self.nodes.get(ino)?;
        let stream = DirStream::open(dir, Arc::clone(&self.nodes))?;
        Ok(self.dirs.insert(Arc::new(Mutex::new(stream))))
    }

    /// Feeds entries from `offset` on to `add` until it reports a full
    /// buffer. `add` receives the offset of the entry after the current one.
    pub fn readdir<F>(&self, fh: u64, offset: i64, mut add: F) -> FuseResult<()>
    where
        F: FnMut(u64, i64, FileType, &str) -> bool,
    {
        let stream = self.dir_stream(fh)?;
        let mut stream = stream.lock();
        let mut index = to_index(offset)?;
        while let Some(entry) = stream.entry_at(index)? {
            index += 1;
            if add(entry.ino, index as i64, file_type(entry.mode), &entry.name) {
                break;
            }
        }
        Ok(())
    }

    /// Like [`readdir`](Self::readdir) with attributes. Every child the
    /// kernel accepts gains one lookup reference.
    pub fn readdirplus<F>(&self, fh: u64, offset: i64, mut add: F) -> FuseResult<()>
    where
        F: FnMut(u64, i64, &str, &FileAttr) -> bool,
    {
        let stream = self.dir_stream(fh)?;
        let mut stream = stream.lock();
        let dir = Arc::clone(stream.dir());
        let mut index = to_index(offset)?;
        while let Some(entry) = stream.entry_at(index)?.cloned() {
            index += 1;
            let attr = match &entry.node {
                Some(node) => node.getattr()?,
                None if entry.ino == dir.ino() => dir.getattr()?,
                None => file_attr(
                    entry.ino,
                    entry.mode,
                    0,
                    SystemTime::now(),
                    self.root.uid(),
                    self.root.gid(),
                ),
            };
            if add(entry.ino, index as i64, &entry.name, &attr) {
                break;
            }
            if let Some(node) = entry.node {
                self.nodes.attach(node);
            }
        }
        Ok(())
    }

    pub fn releasedir(&self, fh: u64) -> FuseResult<()> {
        let stream = self.dirs.remove(fh).ok_or(FuseError::InvalidHandle(fh))?;
        stream.lock().close();
        Ok(())
    }

    /// Creates a directory node. Directories are implicit in the store, so
    /// nothing is written until a file is created inside.
    pub fn mkdir(&self, parent: u64, name: &str) -> FuseResult<FileAttr> {
        validate_name(name)?;
        let dir = self.directory(parent)?;
        let child = self.register(&dir, Node::new_child(&dir, name, true, None));
        dir.record_entry(child.current_entry());
        debug!(parent, name, "Directory created locally");
        child.getattr()
    }

    /// Removes the object `name` from the store.
    pub fn unlink(&self, parent: u64, name: &str) -> FuseResult<()> {
        validate_name(name)?;
        let dir = self.directory(parent)?;
        let path = join(dir.path(), name);
        self.root.store().remove(self.root.ctx(), &path)?;
        self.drop_name(&dir, name, &path);
        debug!(parent, path = %path, "Object removed");
        Ok(())
    }

    /// Succeeds without touching the store.
    pub fn rmdir(&self, parent: u64, name: &str) -> FuseResult<()> {
        validate_name(name)?;
        let dir = self.directory(parent)?;
        let path = join(dir.path(), name);
        self.drop_name(&dir, name, &path);
        Ok(())
    }

    fn drop_name(&self, dir: &Node, name: &str, path: &str) {
        dir.forget_entry(name);
        dir.detach_child(name);
        self.nodes.remove(identity_of(path));
    }

    pub fn access(&self, _ino: u64, _mask: i32) -> FuseResult<()> {
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        STATFS
    }
}

fn to_offset(offset: i64) -> FuseResult<u64> {
    u64::try_from(offset).map_err(|_| FuseError::Errno(libc::EINVAL))
}

fn to_index(offset: i64) -> FuseResult<usize> {
    usize::try_from(offset).map_err(|_| FuseError::Errno(libc::EINVAL))
}

/// Maps an error to errno, logging anything but plain absence.
fn errno(op: &'static str, e: &FuseError) -> c_int {
    let code = e.to_errno();
    if code != libc::ENOENT {
        debug!(op, error = %e, errno = code, "Operation failed");
    }
    code
}

fn utf8_name(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_string)
}

/// `fuser` front end of an [`Adapter`].
#[derive(Debug)]
pub struct ObjectFs {
    adapter: Adapter,
    pool: WorkerPool,
    entry_ttl: Duration,
    attr_ttl: Duration,
}

impl ObjectFs {
    /// Starts the worker pool sized by the adapter's configuration.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn new(adapter: Adapter) -> io::Result<Self> {
        let config = adapter.config();
        let pool = WorkerPool::new(config.worker_threads)?;
        Ok(Self {
            entry_ttl: config.entry_ttl,
            attr_ttl: config.attr_ttl,
            adapter,
            pool,
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

impl Filesystem for ObjectFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(
            store = self.adapter.store_name(),
            workers = self.pool.threads(),
            "FUSE filesystem initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.pool.shutdown();
        info!(
            nodes = self.adapter.node_count(),
            open_files = self.adapter.open_files(),
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!(parent, name = %name, "lookup");
        let adapter = self.adapter.clone();
        let ttl = self.entry_ttl;
        self.pool.spawn(move || match adapter.lookup(parent, &name) {
            Ok(attr) => reply.entry(&ttl, &attr, 0),
            Err(e) => reply.error(errno("lookup", &e)),
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.adapter.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.adapter.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, ?fh, "getattr");
        let adapter = self.adapter.clone();
        let ttl = self.attr_ttl;
        self.pool.spawn(move || match adapter.getattr(ino, fh) {
            Ok(attr) => reply.attr(&ttl, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?fh, ?size, "setattr");
        let adapter = self.adapter.clone();
        let ttl = self.attr_ttl;
        self.pool.spawn(move || match adapter.setattr(ino, fh, size) {
            Ok(attr) => reply.attr(&ttl, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!(parent, name = %name, "mkdir");
        let adapter = self.adapter.clone();
        let ttl = self.entry_ttl;
        self.pool.spawn(move || match adapter.mkdir(parent, &name) {
            Ok(attr) => reply.entry(&ttl, &attr, 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!(parent, name = %name, "unlink");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.unlink(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!(parent, name = %name, "rmdir");
        match self.adapter.rmdir(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let adapter = self.adapter.clone();
        let data = data.to_vec();
        self.pool.spawn(move || match adapter.write(fh, offset, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", &e)),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &e)),
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "fsync");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("opendir", &e)),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh, offset, "readdir");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || {
            let result = adapter.readdir(fh, offset, |ino, next, kind, name| {
                reply.add(ino, next, kind, name)
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("readdir", &e)),
            }
        });
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        trace!(inode = ino, fh, offset, "readdirplus");
        let adapter = self.adapter.clone();
        let ttl = self.entry_ttl;
        self.pool.spawn(move || {
            let result = adapter.readdirplus(fh, offset, |ino, next, name, attr| {
                reply.add(ino, next, name, &ttl, attr, 0)
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("readdirplus", &e)),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "releasedir");
        match self.adapter.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("releasedir", &e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.adapter.statfs();
        reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.adapter.access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!(parent, name = %name, flags, "create");
        let adapter = self.adapter.clone();
        let ttl = self.entry_ttl;
        self.pool.spawn(move || match adapter.create(parent, &name, flags) {
            Ok((attr, fh)) => reply.created(&ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", &e)),
        });
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        trace!(inode = ino, fh, offset, whence, "lseek");
        let adapter = self.adapter.clone();
        self.pool.spawn(move || match adapter.lseek(fh, offset, whence) {
            Ok(offset) => reply.offset(offset),
            Err(e) => reply.error(errno("lseek", &e)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ROOT_INODE;
    use objfs_core::{ErrorKind, MemoryStore, StoreOp};
    use tempfile::TempDir;

    fn adapter(store: &MemoryStore) -> (TempDir, Adapter) {
        let scratch = TempDir::new().unwrap();
        let config = MountConfig::default()
            .cache_ttl(Duration::from_secs(60))
            .scratch_dir(scratch.path());
        let adapter = Adapter::new(Arc::new(store.clone()), "bucket", config).unwrap();
        (scratch, adapter)
    }

    fn list(adapter: &Adapter, ino: u64) -> Vec<(String, bool)> {
        let fh = adapter.opendir(ino).unwrap();
        let mut out = Vec::new();
        adapter
            .readdir(fh, 0, |_, _, kind, name| {
                out.push((name.to_string(), kind == FileType::Directory));
                false
            })
            .unwrap();
        adapter.releasedir(fh).unwrap();
        out
    }

    #[test]
    fn test_lookup_counts_kernel_references() {
        let store = MemoryStore::new();
        store.put("bucket/f", "abc");
        let (_tmp, fs) = adapter(&store);

        let attr = fs.lookup(ROOT_INODE, "f").unwrap();
        assert_eq!(attr.size, 3);
        fs.lookup(ROOT_INODE, "f").unwrap();
        assert_eq!(fs.nodes.nlookup(attr.ino), Some(2));

        fs.forget(attr.ino, 2);
        assert_eq!(fs.getattr(attr.ino, None).unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_readdir_paginates_by_offset() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            store.put(format!("bucket/{name}"), name);
        }
        let (_tmp, fs) = adapter(&store);
        let fh = fs.opendir(ROOT_INODE).unwrap();

        let mut first = Vec::new();
        fs.readdir(fh, 0, |_, next, _, name| {
            first.push((name.to_string(), next));
            first.len() == 2
        })
        .unwrap();
        assert_eq!(first, vec![(".".to_string(), 1), ("a".to_string(), 2)]);

        let mut rest = Vec::new();
        fs.readdir(fh, 1, |_, _, _, name| {
            rest.push(name.to_string());
            false
        })
        .unwrap();
        assert_eq!(rest, ["a", "b", "c"]);
        fs.releasedir(fh).unwrap();
        assert_eq!(store.op_count(StoreOp::List), 1);
    }

    #[test]
    fn test_readdirplus_counts_only_accepted_children() {
        let store = MemoryStore::new();
        store.put("bucket/d/x", "12345");
        store.put("bucket/d/y", "1");
        let (_tmp, fs) = adapter(&store);
        let d = fs.lookup(ROOT_INODE, "d").unwrap().ino;
        let fh = fs.opendir(d).unwrap();

        let mut seen = Vec::new();
        fs.readdirplus(fh, 0, |ino, _, name, attr| {
            seen.push((name.to_string(), ino, attr.size));
            name == "y"
        })
        .unwrap();
        fs.releasedir(fh).unwrap();

        let names: Vec<_> = seen.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, ["..", ".", "x", "y"]);
        assert_eq!(seen[0].1, ROOT_INODE);
        assert_eq!(seen[2].2, 5);
        assert_eq!(fs.nodes.nlookup(seen[2].1), Some(1));
        assert_eq!(fs.nodes.nlookup(seen[3].1), None, "rejected entry not registered");
    }

    #[test]
    fn test_directory_streams_leave_node_table_unchanged() {
        let store = MemoryStore::new();
        for name in ["a", "b", "sub/c"] {
            store.put(format!("bucket/{name}"), name);
        }
        let (_tmp, fs) = adapter(&store);
        let baseline = fs.node_count();

        for _ in 0..3 {
            assert_eq!(list(&fs, ROOT_INODE).len(), 4);
            assert_eq!(fs.node_count(), baseline);
        }

        let fh = fs.opendir(ROOT_INODE).unwrap();
        let mut accepted = Vec::new();
        fs.readdirplus(fh, 0, |ino, _, name, _| {
            if name != "." {
                accepted.push(ino);
            }
            false
        })
        .unwrap();
        fs.releasedir(fh).unwrap();
        assert_eq!(fs.node_count(), baseline + 3);

        for ino in accepted {
            fs.forget(ino, 1);
        }
        assert_eq!(fs.node_count(), baseline);
    }

    #[test]
    fn test_failed_create_is_not_listed() {
        let store = MemoryStore::new();
        let (_tmp, fs) = adapter(&store);
        assert_eq!(list(&fs, ROOT_INODE).len(), 1);

        let (_, fh) = fs.create(ROOT_INODE, "ghost", libc::O_WRONLY).unwrap();
        fs.write(fh, 0, b"boo").unwrap();
        store.fail_next(StoreOp::Commit, ErrorKind::Net);
        assert_eq!(fs.flush(fh).unwrap_err().to_errno(), libc::ENETUNREACH);
        fs.release(fh).unwrap();

        assert!(!store.contains("bucket/ghost"));
        assert_eq!(fs.lookup(ROOT_INODE, "ghost").unwrap_err().to_errno(), libc::ENOENT);
        assert_eq!(list(&fs, ROOT_INODE), vec![(".".to_string(), true)]);
    }

    #[test]
    fn test_mkdir_is_not_persisted() {
        let store = MemoryStore::new();
        let (_tmp, fs) = adapter(&store);
        let attr = fs.mkdir(ROOT_INODE, "dir0").unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert!(store.keys().is_empty());
        assert!(list(&fs, attr.ino).iter().all(|(n, _)| n == "." || n == ".."));
        fs.rmdir(ROOT_INODE, "dir0").unwrap();
    }

    #[test]
    fn test_create_then_list() {
        let store = MemoryStore::new();
        let (_tmp, fs) = adapter(&store);
        let (attr, fh) = fs.create(ROOT_INODE, "new.txt", libc::O_WRONLY).unwrap();
        assert_eq!(attr.size, 0);
        fs.write(fh, 0, b"hello").unwrap();
        fs.flush(fh).unwrap();
        fs.release(fh).unwrap();

        assert_eq!(store.get("bucket/new.txt").unwrap(), "hello");
        assert_eq!(fs.getattr(attr.ino, None).unwrap().size, 5);
        assert_eq!(list(&fs, ROOT_INODE), vec![(".".to_string(), true), ("new.txt".to_string(), false)]);
    }

    #[test]
    fn test_setattr_without_handle() {
        let store = MemoryStore::new();
        store.put("bucket/f", "content");
        let (_tmp, fs) = adapter(&store);
        let ino = fs.lookup(ROOT_INODE, "f").unwrap().ino;

        assert_eq!(fs.setattr(ino, None, Some(3)).unwrap_err().to_errno(), libc::ENOSYS);
        assert_eq!(fs.setattr(ino, None, Some(0)).unwrap().size, 0);
        assert_eq!(store.get("bucket/f").unwrap().len(), 0);
        assert_eq!(fs.setattr(ROOT_INODE, None, Some(0)).unwrap_err().to_errno(), libc::EISDIR);
    }

    #[test]
    fn test_getattr_through_handle_sees_unflushed_size() {
        let store = MemoryStore::new();
        store.put("bucket/f", "abc");
        let (_tmp, fs) = adapter(&store);
        let ino = fs.lookup(ROOT_INODE, "f").unwrap().ino;
        let fh = fs.open(ino, libc::O_RDWR).unwrap();
        fs.write(fh, 3, b"defg").unwrap();
        assert_eq!(fs.getattr(ino, Some(fh)).unwrap().size, 7);
        assert_eq!(fs.getattr(ino, None).unwrap().size, 3);
        fs.release(fh).unwrap();
        assert_eq!(fs.getattr(ino, None).unwrap().size, 7);
    }

    #[test]
    fn test_unlink_removes_and_forgets() {
        let store = MemoryStore::new();
        store.put("bucket/fox.txt", "pink fox");
        let (_tmp, fs) = adapter(&store);
        let ino = fs.lookup(ROOT_INODE, "fox.txt").unwrap().ino;

        fs.unlink(ROOT_INODE, "fox.txt").unwrap();
        assert!(!store.contains("bucket/fox.txt"));
        assert_eq!(fs.getattr(ino, None).unwrap_err().to_errno(), libc::ENOENT);
        assert_eq!(fs.lookup(ROOT_INODE, "fox.txt").unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_unlink_failure_surfaces_errno() {
        let store = MemoryStore::new();
        store.put("bucket/f", "x");
        let (_tmp, fs) = adapter(&store);
        store.fail_next(StoreOp::Remove, ErrorKind::NotAllowed);
        assert_eq!(fs.unlink(ROOT_INODE, "f").unwrap_err().to_errno(), libc::EACCES);
    }

    #[test]
    fn test_invalid_names_and_handles() {
        let store = MemoryStore::new();
        let (_tmp, fs) = adapter(&store);
        assert_eq!(fs.lookup(ROOT_INODE, "a/b").unwrap_err().to_errno(), libc::EINVAL);
        assert_eq!(fs.mkdir(ROOT_INODE, "..").unwrap_err().to_errno(), libc::EINVAL);
        assert_eq!(fs.read(99, 0, 1).unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(fs.release(99).unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(fs.releasedir(99).unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(fs.open(12345, libc::O_RDONLY).unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_directory_listing_marks_directories() {
        let store = MemoryStore::new();
        store.put("bucket/sub/inner", "x");
        store.put("bucket/top", "y");
        let (_tmp, fs) = adapter(&store);
        let entries = list(&fs, ROOT_INODE);
        assert_eq!(
            entries,
            vec![
                (".".to_string(), true),
                ("sub".to_string(), true),
                ("top".to_string(), false)
            ]
        );
        let sub = fs.lookup(ROOT_INODE, "sub").unwrap();
        assert_eq!(sub.kind, FileType::Directory);
        assert_eq!(sub.perm, 0o755);
    }

    #[test]
    fn test_statfs_and_access() {
        let store = MemoryStore::new();
        let (_tmp, fs) = adapter(&store);
        assert!(fs.access(ROOT_INODE, libc::W_OK).is_ok());
        assert_eq!(fs.statfs().namelen, 255);
    }
}
