//! Mount configuration for the FUSE filesystem.
//!
//! The defaults suit a remote object store, where every stat and listing is
//! a network round trip. Use [`MountConfig::local()`] for a local backing
//! directory, where fresher metadata is cheap.

use std::path::PathBuf;
use std::time::Duration;

/// Default lifetime of node-level caches and kernel TTLs (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL used by [`MountConfig::local()`].
pub const LOCAL_TTL: Duration = Duration::from_secs(1);

/// Configuration options for the FUSE filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Lifetime of cached attributes and directory listings held by nodes.
    ///
    /// Default: 5 minutes (network mode) or 1 second (local mode).
    pub cache_ttl: Duration,

    /// Entry TTL advertised to the kernel in lookup replies.
    pub entry_ttl: Duration,

    /// Attribute TTL advertised to the kernel.
    pub attr_ttl: Duration,

    /// Number of worker threads serving FUSE callbacks.
    ///
    /// Default: one per CPU.
    pub worker_threads: usize,

    /// Private directory for buffered-write scratch files.
    ///
    /// Created with mode 0700 at mount time. Default: `/tmp/objfs-cache-<euid>`.
    pub scratch_dir: PathBuf,
}

/// Default scratch directory for the effective user.
pub fn default_scratch_dir() -> PathBuf {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    std::env::temp_dir().join(format!("objfs-cache-{euid}"))
}

impl Default for MountConfig {
    /// Returns the default configuration for remote stores.
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            entry_ttl: DEFAULT_TTL,
            attr_ttl: DEFAULT_TTL,
            worker_threads: num_cpus::get(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl MountConfig {
    /// Creates a configuration for a local backing directory.
    ///
    /// Uses one-second TTLs everywhere.
    pub fn local() -> Self {
        Self {
            cache_ttl: LOCAL_TTL,
            entry_ttl: LOCAL_TTL,
            attr_ttl: LOCAL_TTL,
            ..Self::default()
        }
    }

    /// Sets the node-level cache lifetime.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets both kernel TTLs.
    #[must_use]
    pub fn kernel_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self.attr_ttl = ttl;
        self
    }

    /// Sets the number of worker threads. Zero is treated as one.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets the scratch directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}
