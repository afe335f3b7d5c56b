//! FUSE filesystem for hierarchical object stores.
//!
//! This crate mounts an [`ObjectStore`](objfs_core::ObjectStore) key space
//! (an S3-like bucket, or a local directory) as a POSIX directory tree.
//!
//! # Features
//!
//! - Stable inode numbers derived from remote paths
//! - Per-node attribute and directory caches with a global invalidation epoch
//! - Three I/O strategies per open file: streaming reads, streaming
//!   sequential writes and a scratch-file buffer for random access
//! - Implicit directories: a key prefix is a directory, and a directory
//!   wins over a same-named object
//! - Callbacks served by a worker pool, one lock per node
//!
//! # Usage
//!
//! ```ignore
//! use objfs_core::LocalStore;
//! use objfs_fuse::{Adapter, FuseBackend, MountConfig};
//!
//! let adapter = Adapter::new(Arc::new(LocalStore::new()), "/srv/data", MountConfig::local())?;
//! let handle = FuseBackend::new().mount(adapter, mountpoint)?;
//! ```

pub mod attr;
pub mod backend;
pub mod clock;
pub mod config;
pub mod dirstream;
pub mod dispatch;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod identity;
pub mod inode;
pub mod node;
pub mod root;

pub use attr::{CachedAttr, DirEntry, DirEntryCache};
pub use backend::{FuseBackend, FuseMountHandle, MountError};
pub use clock::{Clock, Invalidator};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult, ToErrno};
pub use filesystem::{Adapter, ObjectFs, StatFs};
pub use handles::{FileHandle, HandleTable, StrategyKind};
pub use identity::{ROOT_INODE, identity_of};
pub use inode::NodeTable;
pub use node::Node;
