//! File handle management for the FUSE filesystem.
//!
//! Each open file gets a [`FileHandle`] holding exactly one I/O strategy,
//! chosen once and never switched:
//!
//! - **DirectRead**: a remote read stream, opened eagerly for read-only
//!   opens. Reads seek then fill the buffer; end of stream is a short read.
//! - **DirectWrite**: a remote write stream for write-only opens that start
//!   from empty (`O_TRUNC`, `create`, or a prior truncate to zero). Writes
//!   must arrive in order; flush commits.
//! - **Buffered**: a private scratch file holding a copy of the object, for
//!   everything else. Flush uploads the whole file.
//!
//! Write-capable handles pick their strategy on the first read, write or
//! getattr. Teardown (committing the writer, removing the scratch file)
//! happens once, on the first flush, and its result is replayed to later
//! flushes of duplicated descriptors.
//!
//! Lock order: node lock, then handle lock.

use crate::error::{FuseError, FuseResult};
use crate::node::Node;
use dashmap::DashMap;
use fuser::FileAttr;
use objfs_core::{ReadStream, WriteStream};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Thread-safe handle table with auto-incrementing IDs.
///
/// IDs start at 1 (0 is reserved for invalid/null handle).
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V: Clone> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a value and returns its new ID.
    pub fn insert(&self, value: V) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, value);
        id
    }

    /// Returns a clone of the value for `id`.
    pub fn get(&self, id: u64) -> Option<V> {
        self.handles.get(&id).map(|v| v.clone())
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V: Clone> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which strategy a handle settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Uninit,
    DirectWrite,
    DirectRead,
    Buffered,
}

enum Strategy {
    Uninit,
    DirectWrite {
        /// `None` once committed.
        writer: Option<Box<dyn WriteStream>>,
        offset: u64,
    },
    DirectRead {
        /// `None` once released.
        reader: Option<Box<dyn ReadStream>>,
    },
    Buffered {
        /// `None` once uploaded (or the upload failed).
        scratch: Option<NamedTempFile>,
    },
}

impl Strategy {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Uninit => StrategyKind::Uninit,
            Strategy::DirectWrite { .. } => StrategyKind::DirectWrite,
            Strategy::DirectRead { .. } => StrategyKind::DirectRead,
            Strategy::Buffered { .. } => StrategyKind::Buffered,
        }
    }
}

struct HandleIo {
    /// Size requested by a truncate before any I/O.
    requested_size: Option<u64>,
    /// Result of the first flush, as an errno on failure.
    flushed: Option<Result<(), i32>>,
    strategy: Strategy,
}

/// State for one open file.
pub struct FileHandle {
    node: Arc<Node>,
    flags: i32,
    created: bool,
    io: Mutex<HandleIo>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("ino", &self.node.ino())
            .field("flags", &format_args!("{:#o}", self.flags))
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    fn new(node: Arc<Node>, flags: i32, created: bool, requested_size: Option<u64>) -> Self {
        Self {
            node,
            flags,
            created,
            io: Mutex::new(HandleIo {
                requested_size,
                flushed: None,
                strategy: Strategy::Uninit,
            }),
        }
    }

    /// Opens an existing file. Read-only opens get their reader right away.
    pub fn open(node: Arc<Node>, flags: i32) -> FuseResult<Self> {
        if node.is_dir() {
            return Err(FuseError::IsDirectory);
        }
        let handle = Self::new(node, flags, false, None);
        if handle.is_read_only() {
            let _state = handle.node.lock();
            let mut io = handle.io.lock();
            handle.ensure_strategy(&mut io)?;
        }
        Ok(handle)
    }

    /// A handle for a file that is being created. It starts empty.
    pub fn create(node: Arc<Node>, flags: i32) -> Self {
        Self::new(node, flags | libc::O_CREAT | libc::O_TRUNC, true, Some(0))
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & libc::O_ACCMODE == libc::O_RDONLY
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.io.lock().strategy.kind()
    }

    /// True if the file must be written out even without any write.
    fn must_materialize(&self, io: &HandleIo) -> bool {
        self.created || self.flags & libc::O_TRUNC != 0 || io.requested_size.is_some()
    }

    /// Picks the strategy if none was picked yet. Caller holds the node lock.
    fn ensure_strategy(&self, io: &mut HandleIo) -> FuseResult<()> {
        if !matches!(io.strategy, Strategy::Uninit) {
            return Ok(());
        }
        let adapter = self.node.adapter();
        let path = self.node.path();

        if self.is_read_only() {
            let reader = adapter.store().open(adapter.ctx(), path)?;
            debug!(inode = self.node.ino(), path, "Selected direct read");
            io.strategy = Strategy::DirectRead {
                reader: Some(reader),
            };
            return Ok(());
        }

        let truncating = self.flags & libc::O_TRUNC != 0 || io.requested_size == Some(0);
        if self.flags & libc::O_RDWR == 0 && truncating {
            let writer = adapter.store().create(adapter.ctx(), path)?;
            debug!(inode = self.node.ino(), path, "Selected direct write");
            io.strategy = Strategy::DirectWrite {
                writer: Some(writer),
                offset: 0,
            };
            return Ok(());
        }

        let mut scratch = tempfile::Builder::new()
            .prefix(&format!("{:016x}.", self.node.identity()))
            .tempfile_in(adapter.scratch_dir())?;
        if !(self.created || truncating) {
            let mut reader = adapter.store().open(adapter.ctx(), path)?;
            let copied = io::copy(&mut reader, scratch.as_file_mut())?;
            reader.close(adapter.ctx())?;
            trace!(inode = self.node.ino(), bytes = copied, "Copied remote object to scratch");
        }
        if let Some(size) = io.requested_size {
            scratch.as_file().set_len(size)?;
        }
        debug!(inode = self.node.ino(), path, scratch = %scratch.path().display(), "Selected buffered I/O");
        io.strategy = Strategy::Buffered {
            scratch: Some(scratch),
        };
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`. Short reads mean end of file.
    ///
    /// # Panics
    ///
    /// Panics if the remote stream seeks somewhere other than `offset`.
    pub fn read(&self, offset: u64, size: u32) -> FuseResult<Vec<u8>> {
        let _state = self.node.lock();
        let mut guard = self.io.lock();
        let io = &mut *guard;
        self.ensure_strategy(io)?;
        match &mut io.strategy {
            Strategy::DirectRead {
                reader: Some(reader),
            } => {
                let pos = reader.seek(SeekFrom::Start(offset))?;
                assert_eq!(pos, offset, "remote stream seeked to {pos}, wanted {offset}");
                Ok(read_full(reader, size as usize)?)
            }
            Strategy::Buffered {
                scratch: Some(scratch),
            } => Ok(read_full_at(scratch.as_file(), offset, size as usize)?),
            Strategy::Uninit => unreachable!("read with no I/O strategy"),
            _ => Err(FuseError::WrongHandleType),
        }
    }

    /// Writes `data` at `offset`, returning the number of bytes written.
    ///
    /// A failed direct write may have sent part of `data`, so the writer is
    /// discarded and the handle replays the error from then on.
    pub fn write(&self, offset: u64, data: &[u8]) -> FuseResult<u32> {
        let _state = self.node.lock();
        let mut guard = self.io.lock();
        let io = &mut *guard;
        self.ensure_strategy(io)?;
        let written = match &mut io.strategy {
            Strategy::DirectWrite {
                writer: Some(writer),
                offset: current,
            } => {
                if offset != *current {
                    return Err(FuseError::OffsetMismatch {
                        expected: *current,
                        actual: offset,
                    });
                }
                let result = writer.write_all(data);
                if result.is_ok() {
                    *current += data.len() as u64;
                }
                result
            }
            Strategy::Buffered {
                scratch: Some(scratch),
            } => {
                scratch.as_file().write_all_at(data, offset)?;
                Ok(())
            }
            Strategy::Uninit => unreachable!("write with no I/O strategy"),
            _ => return Err(FuseError::WrongHandleType),
        };
        if let Err(e) = written {
            return Err(self.poison(io, e.into()));
        }
        Ok(data.len() as u32)
    }

    /// Abandons a direct writer after a failed write and records `e` as the
    /// flush result.
    fn poison(&self, io: &mut HandleIo, e: FuseError) -> FuseError {
        if let Strategy::DirectWrite { writer, .. } = &mut io.strategy
            && let Some(writer) = writer.take()
        {
            writer.discard();
        }
        io.flushed = Some(Err(e.to_errno()));
        warn!(inode = self.node.ino(), path = %self.node.path(), error = %e, "Direct write failed, object discarded");
        e
    }

    /// Kernel attributes as seen through this handle.
    ///
    /// A live scratch file or direct writer is authoritative for size;
    /// otherwise the node cache answers.
    pub fn attr(&self) -> FuseResult<FileAttr> {
        let mut state = self.node.lock();
        {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if !self.is_read_only() {
                self.ensure_strategy(io)?;
            }
            match &io.strategy {
                Strategy::Buffered {
                    scratch: Some(scratch),
                } => {
                    let md = scratch.as_file().metadata()?;
                    let mtime = md.modified().unwrap_or_else(|_| SystemTime::now());
                    return Ok(self.node.kernel_attr(md.len(), mtime));
                }
                Strategy::DirectWrite {
                    writer: Some(_),
                    offset,
                } => return Ok(self.node.kernel_attr(*offset, SystemTime::now())),
                _ => {}
            }
        }
        let attr = self.node.current_attr(&mut state)?;
        Ok(self.node.kernel_attr(attr.size, attr.mtime))
    }

    /// Current size as seen through this handle.
    pub fn size(&self) -> FuseResult<u64> {
        let mut state = self.node.lock();
        {
            let guard = self.io.lock();
            match &guard.strategy {
                Strategy::Buffered {
                    scratch: Some(scratch),
                } => return Ok(scratch.as_file().metadata()?.len()),
                Strategy::DirectWrite {
                    writer: Some(_),
                    offset,
                } => return Ok(*offset),
                _ => {}
            }
        }
        Ok(self.node.current_attr(&mut state)?.size)
    }

    /// Tears down the write strategy once and replays the result afterwards.
    ///
    /// On success the node's cached attributes are updated and, after the
    /// node lock is released, published to the parent directory cache.
    pub fn flush(&self) -> FuseResult<()> {
        {
            let mut state = self.node.lock();
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if let Some(result) = io.flushed {
                trace!(inode = self.node.ino(), "Flush replayed");
                return result.map_err(FuseError::Errno);
            }
            if matches!(io.strategy, Strategy::Uninit) {
                if !self.must_materialize(io) {
                    return Ok(());
                }
                if let Err(e) = self.ensure_strategy(io) {
                    io.flushed = Some(Err(e.to_errno()));
                    warn!(inode = self.node.ino(), path = %self.node.path(), error = %e, "Flush failed");
                    return Err(e);
                }
            }

            let adapter = self.node.adapter();
            let outcome = match &mut io.strategy {
                Strategy::DirectWrite { writer, offset } => {
                    let size = *offset;
                    match writer.take() {
                        Some(writer) => writer.close(adapter.ctx()).map(|()| size).map_err(FuseError::from),
                        None => Ok(size),
                    }
                }
                Strategy::Buffered { scratch } => match scratch.take() {
                    Some(scratch) => self.upload(scratch),
                    None => return Ok(()),
                },
                Strategy::DirectRead { .. } => return Ok(()),
                Strategy::Uninit => unreachable!("flush with no I/O strategy"),
            };

            match outcome {
                Ok(size) => {
                    self.node.record_attr(&mut state, size, SystemTime::now());
                    io.flushed = Some(Ok(()));
                    debug!(inode = self.node.ino(), path = %self.node.path(), size, "Flushed to store");
                }
                Err(e) => {
                    let code = e.to_errno();
                    io.flushed = Some(Err(code));
                    warn!(inode = self.node.ino(), path = %self.node.path(), error = %e, "Flush failed");
                    return Err(e);
                }
            }
        }
        self.node.publish_to_parent();
        Ok(())
    }

    /// Streams the scratch file to a new remote object. The scratch file is
    /// removed when this returns.
    fn upload(&self, scratch: NamedTempFile) -> FuseResult<u64> {
        let adapter = self.node.adapter();
        let mut file: &File = scratch.as_file();
        file.seek(SeekFrom::Start(0))?;
        let size = file.metadata()?.len();
        let mut writer = adapter.store().create(adapter.ctx(), self.node.path())?;
        if let Err(e) = io::copy(&mut file, &mut writer) {
            writer.discard();
            return Err(e.into());
        }
        writer.close(adapter.ctx())?;
        Ok(size)
    }

    /// Updates the node's cached size from a direct writer's running offset.
    pub fn fsync(&self) -> FuseResult<()> {
        let mut state = self.node.lock();
        let guard = self.io.lock();
        if let Strategy::DirectWrite {
            writer: Some(_),
            offset,
        } = &guard.strategy
        {
            self.node.record_attr(&mut state, *offset, SystemTime::now());
        }
        Ok(())
    }

    /// Closes a reader, or flushes a writer that was never flushed.
    pub fn release(&self) {
        let unflushed = {
            let _state = self.node.lock();
            let mut guard = self.io.lock();
            let io = &mut *guard;
            let pending = self.must_materialize(io) && io.flushed.is_none();
            match &mut io.strategy {
                Strategy::DirectRead { reader } => {
                    if let Some(reader) = reader.take() {
                        let adapter = self.node.adapter();
                        if let Err(e) = reader.close(adapter.ctx()) {
                            warn!(inode = self.node.ino(), error = %e, "Closing remote reader failed");
                        }
                    }
                    false
                }
                Strategy::DirectWrite {
                    writer: Some(_), ..
                }
                | Strategy::Buffered { scratch: Some(_) } => true,
                Strategy::Uninit => pending,
                _ => false,
            }
        };
        if unflushed {
            warn!(inode = self.node.ino(), path = %self.node.path(), "Handle released without flush, flushing now");
            if let Err(e) = self.flush() {
                warn!(inode = self.node.ino(), error = %e, "Flush on release failed");
            }
        }
    }

    /// Truncates through this handle.
    pub fn set_size(&self, size: u64) -> FuseResult<()> {
        let _state = self.node.lock();
        let mut guard = self.io.lock();
        let io = &mut *guard;
        match &mut io.strategy {
            Strategy::Uninit => {
                io.requested_size = Some(size);
                Ok(())
            }
            Strategy::DirectWrite { offset, .. } if *offset == size => Ok(()),
            Strategy::DirectWrite { .. } => Err(FuseError::NotSupported("truncate during direct write")),
            Strategy::DirectRead { .. } => Err(FuseError::ReadOnly),
            Strategy::Buffered {
                scratch: Some(scratch),
            } => {
                scratch.as_file().set_len(size)?;
                Ok(())
            }
            Strategy::Buffered { scratch: None } => Err(FuseError::WrongHandleType),
        }
    }

    /// SEEK_DATA returns `offset` (files have no holes), SEEK_HOLE the size.
    pub fn lseek(&self, offset: i64, whence: i32) -> FuseResult<i64> {
        match whence {
            libc::SEEK_DATA => Ok(offset),
            libc::SEEK_HOLE => Ok(self.size()? as i64),
            _ => Err(FuseError::NotSupported("lseek whence")),
        }
    }
}

fn read_full(reader: &mut dyn Read, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn read_full_at(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_root;
    use objfs_core::{ErrorKind, MemoryStore, StoreOp};

    const WRONLY_TRUNC: i32 = libc::O_WRONLY | libc::O_TRUNC;

    fn file_node(store: &MemoryStore, name: &str) -> (tempfile::TempDir, Arc<Node>) {
        let (tmp, root) = test_root(store);
        let node = root.lookup(name).unwrap();
        (tmp, node)
    }

    #[test]
    fn test_handle_table_ids_start_at_one() {
        let table: HandleTable<u32> = HandleTable::new();
        let a = table.insert(10);
        let b = table.insert(20);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.get(a), Some(10));
        assert_eq!(table.remove(a), Some(10));
        assert!(table.get(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_read_only_open_is_eager() {
        let store = MemoryStore::new();
        store.put("bucket/f", "hello world");
        let (_tmp, node) = file_node(&store, "f");

        let h = FileHandle::open(node, libc::O_RDONLY).unwrap();
        assert_eq!(h.strategy_kind(), StrategyKind::DirectRead);
        assert_eq!(store.op_count(StoreOp::Open), 1);
        assert_eq!(h.read(6, 100).unwrap(), b"world");
        assert_eq!(h.read(0, 5).unwrap(), b"hello");
        assert!(h.read(64, 10).unwrap().is_empty());
        assert_eq!(h.write(0, b"x").unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(h.set_size(0).unwrap_err().to_errno(), libc::EPERM);
        h.release();
        assert_eq!(h.read(0, 1).unwrap_err().to_errno(), libc::EBADF);
    }

    #[test]
    fn test_open_missing_object_fails() {
        let store = MemoryStore::new();
        store.put("bucket/f", "x");
        let (_tmp, node) = file_node(&store, "f");
        store.fail_next(StoreOp::Open, ErrorKind::NotExist);
        assert_eq!(FileHandle::open(node, libc::O_RDONLY).unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_write_only_truncating_open_writes_directly() {
        let store = MemoryStore::new();
        store.put("bucket/f", "old content");
        let (_tmp, node) = file_node(&store, "f");

        let h = FileHandle::open(Arc::clone(&node), WRONLY_TRUNC).unwrap();
        assert_eq!(h.strategy_kind(), StrategyKind::Uninit);
        assert_eq!(h.write(0, b"white ").unwrap(), 6);
        assert_eq!(h.strategy_kind(), StrategyKind::DirectWrite);
        assert_eq!(h.write(3, b"x").unwrap_err().to_errno(), libc::EINVAL);
        h.write(6, b"giraffe").unwrap();
        assert_eq!(h.attr().unwrap().size, 13);
        assert_eq!(store.get("bucket/f").unwrap(), "old content", "nothing visible before flush");

        h.flush().unwrap();
        assert_eq!(store.get("bucket/f").unwrap(), "white giraffe");
        assert_eq!(node.getattr().unwrap().size, 13);
        assert_eq!(h.write(13, b"!").unwrap_err().to_errno(), libc::EBADF);
    }

    #[test]
    fn test_double_flush_is_idempotent() {
        let store = MemoryStore::new();
        store.put("bucket/f", "");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, WRONLY_TRUNC).unwrap();
        h.write(0, b"abc").unwrap();
        h.flush().unwrap();
        h.flush().unwrap();
        assert_eq!(store.op_count(StoreOp::Commit), 1);
    }

    #[test]
    fn test_failed_flush_result_is_replayed() {
        let store = MemoryStore::new();
        store.put("bucket/f", "keep");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, WRONLY_TRUNC).unwrap();
        h.write(0, b"lost").unwrap();
        store.fail_next(StoreOp::Commit, ErrorKind::Net);

        assert_eq!(h.flush().unwrap_err().to_errno(), libc::ENETUNREACH);
        assert_eq!(h.flush().unwrap_err().to_errno(), libc::ENETUNREACH);
        assert_eq!(store.get("bucket/f").unwrap(), "keep");
    }

    #[test]
    fn test_failed_direct_write_poisons_handle() {
        let store = MemoryStore::new();
        store.put("bucket/f", "keep");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(Arc::clone(&node), WRONLY_TRUNC).unwrap();
        h.write(0, b"first ").unwrap();
        store.fail_next(StoreOp::Write, ErrorKind::Net);

        assert_eq!(h.write(6, b"second").unwrap_err().to_errno(), libc::EIO);
        assert_eq!(h.write(6, b"second").unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(h.flush().unwrap_err().to_errno(), libc::EIO);
        h.release();

        assert_eq!(store.get("bucket/f").unwrap(), "keep");
        assert_eq!(store.op_count(StoreOp::Commit), 0);
    }

    #[test]
    fn test_failed_materialize_in_flush_is_replayed() {
        let store = MemoryStore::new();
        store.put("bucket/f", "keep");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, WRONLY_TRUNC).unwrap();
        store.fail_next(StoreOp::Create, ErrorKind::Unavailable);

        assert_eq!(h.flush().unwrap_err().to_errno(), libc::EAGAIN);
        assert_eq!(h.flush().unwrap_err().to_errno(), libc::EAGAIN);
        h.release();
        assert_eq!(store.op_count(StoreOp::Create), 1);
        assert_eq!(store.get("bucket/f").unwrap(), "keep");
    }

    #[test]
    fn test_buffered_preserves_untouched_ranges() {
        let store = MemoryStore::new();
        store.put("bucket/baz", "purple cat");
        let (_tmp, node) = file_node(&store, "baz");

        let h = FileHandle::open(Arc::clone(&node), libc::O_RDWR).unwrap();
        h.write(0, b"yellow").unwrap();
        assert_eq!(h.strategy_kind(), StrategyKind::Buffered);
        assert_eq!(h.read(0, 64).unwrap(), b"yellow cat");
        h.flush().unwrap();
        assert_eq!(store.get("bucket/baz").unwrap(), "yellow cat");

        let h = FileHandle::open(node, libc::O_RDWR).unwrap();
        h.write(7, b"b").unwrap();
        h.flush().unwrap();
        assert_eq!(store.get("bucket/baz").unwrap(), "yellow bat");
    }

    #[test]
    fn test_scratch_file_removed_after_flush() {
        let store = MemoryStore::new();
        store.put("bucket/f", "data");
        let (tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, libc::O_RDWR).unwrap();
        h.write(4, b"more").unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);

        store.fail_next(StoreOp::Create, ErrorKind::Unavailable);
        assert_eq!(h.flush().unwrap_err().to_errno(), libc::EAGAIN);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0, "removed even on failure");
        assert_eq!(h.write(0, b"x").unwrap_err().to_errno(), libc::EBADF);
    }

    #[test]
    fn test_append_through_buffered_handle() {
        let store = MemoryStore::new();
        store.put("bucket/a", "orange ");
        let (_tmp, node) = file_node(&store, "a");
        let h = FileHandle::open(node, libc::O_WRONLY | libc::O_APPEND).unwrap();
        let size = h.attr().unwrap().size;
        assert_eq!(h.strategy_kind(), StrategyKind::Buffered);
        h.write(size, b"apered donkey").unwrap();
        h.flush().unwrap();
        assert_eq!(store.get("bucket/a").unwrap(), "orange apered donkey");
    }

    #[test]
    fn test_truncate_before_io_is_applied() {
        let store = MemoryStore::new();
        store.put("bucket/f", "0123456789");
        let (_tmp, node) = file_node(&store, "f");

        let h = FileHandle::open(Arc::clone(&node), libc::O_RDWR).unwrap();
        h.set_size(4).unwrap();
        assert_eq!(h.read(0, 64).unwrap(), b"0123");
        h.release();
        assert_eq!(store.get("bucket/f").unwrap(), "0123");

        let h = FileHandle::open(node, libc::O_WRONLY).unwrap();
        h.set_size(0).unwrap();
        h.write(0, b"new").unwrap();
        assert_eq!(h.strategy_kind(), StrategyKind::DirectWrite);
        assert_eq!(h.set_size(3).map_err(|e| e.to_errno()), Ok(()));
        assert_eq!(h.set_size(1).unwrap_err().to_errno(), libc::ENOSYS);
        h.flush().unwrap();
        assert_eq!(store.get("bucket/f").unwrap(), "new");
    }

    #[test]
    fn test_created_handle_materializes_empty_object() {
        let store = MemoryStore::new();
        let (_tmp, root) = test_root(&store);
        let node = Node::new_child(&root, "touched", false, None);
        let h = FileHandle::create(node, libc::O_WRONLY);
        h.release();
        assert_eq!(store.get("bucket/touched").unwrap().len(), 0);
    }

    #[test]
    fn test_plain_open_without_io_touches_nothing() {
        let store = MemoryStore::new();
        store.put("bucket/f", "x");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, libc::O_WRONLY).unwrap();
        h.flush().unwrap();
        h.release();
        assert_eq!(store.op_count(StoreOp::Create), 0);
    }

    #[test]
    fn test_fsync_updates_cached_size() {
        let store = MemoryStore::new();
        store.put("bucket/f", "");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(Arc::clone(&node), WRONLY_TRUNC).unwrap();
        h.write(0, b"12345").unwrap();
        h.fsync().unwrap();
        assert_eq!(node.getattr().unwrap().size, 5);
        assert_eq!(store.op_count(StoreOp::Commit), 0);
    }

    #[test]
    fn test_lseek() {
        let store = MemoryStore::new();
        store.put("bucket/f", "abcdef");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, libc::O_RDONLY).unwrap();
        assert_eq!(h.lseek(3, libc::SEEK_DATA).unwrap(), 3);
        assert_eq!(h.lseek(0, libc::SEEK_HOLE).unwrap(), 6);
        assert_eq!(h.lseek(0, libc::SEEK_END).unwrap_err().to_errno(), libc::ENOSYS);
    }

    #[test]
    fn test_release_flushes_unflushed_writer() {
        let store = MemoryStore::new();
        store.put("bucket/f", "");
        let (_tmp, node) = file_node(&store, "f");
        let h = FileHandle::open(node, WRONLY_TRUNC).unwrap();
        h.write(0, b"late").unwrap();
        h.release();
        assert_eq!(store.get("bucket/f").unwrap(), "late");
    }

    #[test]
    fn test_open_directory_is_eisdir() {
        let store = MemoryStore::new();
        let (_tmp, root) = test_root(&store);
        assert_eq!(FileHandle::open(root, libc::O_RDONLY).unwrap_err().to_errno(), libc::EISDIR);
    }
}
