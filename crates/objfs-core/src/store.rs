//! The object store contract consumed by the FUSE adapter.
//!
//! # Model
//!
//! A store is a flat namespace of objects addressed by slash-separated
//! paths. Directories are implicit: a path is a directory when some object
//! lives under `path/`. Some stores also keep zero-length "marker" objects
//! whose key ends in `/`.
//!
//! # Listings
//!
//! [`ObjectStore::list`] returns a lazy [`Listing`]. A non-recursive listing
//! of a prefix yields its immediate children (subdirectories may carry a
//! trailing `/`), and may include the prefix itself as a marker. A recursive
//! listing yields objects at or below the path and never synthesises
//! directory entries.

use crate::context::StoreContext;
use crate::error::StoreResult;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::time::SystemTime;

/// Size and modification time of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub mtime: SystemTime,
}

/// One entry produced by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Full remote path of the entry.
    pub path: String,
    pub is_dir: bool,
    /// Object metadata, when the store has it on hand for free.
    pub info: Option<FileInfo>,
}

impl ListEntry {
    pub fn file(path: impl Into<String>, info: FileInfo) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            info: Some(info),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            info: None,
        }
    }
}

/// Lazily evaluated sequence of listing entries.
pub type Listing = Box<dyn Iterator<Item = StoreResult<ListEntry>> + Send>;

/// A readable, seekable stream over one object.
pub trait ReadStream: Read + Seek + Send {
    /// Releases the stream.
    fn close(self: Box<Self>, ctx: &StoreContext) -> StoreResult<()>;
}

/// A writable stream that creates one object.
///
/// Nothing is visible in the store until [`close`](WriteStream::close)
/// succeeds.
pub trait WriteStream: Write + Send {
    /// Commits the written bytes as the object's new content.
    fn close(self: Box<Self>, ctx: &StoreContext) -> StoreResult<()>;

    /// Abandons the write. The previous content, if any, is kept.
    fn discard(self: Box<Self>);
}

/// Operations on a remote object store.
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Short human readable name used in logs and as the FUSE fs name.
    fn name(&self) -> &str;

    fn stat(&self, ctx: &StoreContext, path: &str) -> StoreResult<FileInfo>;

    fn open(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn ReadStream>>;

    fn create(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn WriteStream>>;

    /// Lists entries at `path`. See the module docs for the shape of the result.
    fn list(&self, ctx: &StoreContext, path: &str, recursive: bool) -> StoreResult<Listing>;

    fn remove(&self, ctx: &StoreContext, path: &str) -> StoreResult<()>;
}
