//! Object store contract for objfs.
//!
//! This crate defines what the FUSE adapter needs from a remote object
//! store, and ships two implementations:
//!
//! - [`LocalStore`]: a local directory tree, used by the `objfs` binary and
//!   the end-to-end mount tests.
//! - [`MemoryStore`]: a flat S3-like key space held in memory, with directory
//!   markers, same-name file/directory collisions and fault injection.
//!
//! # Example
//!
//! ```
//! use objfs_core::{MemoryStore, ObjectStore, StoreContext};
//! use std::io::Write;
//!
//! let store = MemoryStore::new();
//! let ctx = StoreContext::background();
//! let mut w = store.create(&ctx, "bucket/fox.txt")?;
//! w.write_all(b"pink fox")?;
//! w.close(&ctx)?;
//! assert_eq!(store.stat(&ctx, "bucket/fox.txt")?.size, 8);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod context;
pub mod error;
pub mod local;
pub mod memory;
pub mod path;
pub mod store;

pub use context::StoreContext;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use local::LocalStore;
pub use memory::{MemoryStore, StoreOp};
pub use store::{FileInfo, ListEntry, Listing, ObjectStore, ReadStream, WriteStream};
