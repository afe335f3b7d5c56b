//! Process-wide adapter state.

use crate::clock::{Clock, Invalidator, Timestamp};
use crate::config::MountConfig;
use crate::error::FuseResult;
use objfs_core::{ObjectStore, StoreContext};
use std::fs::DirBuilder;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// State shared by every node of one mount.
///
/// Owned by the root node and reached from any node by walking parent links.
#[derive(Debug)]
pub struct AdapterRoot {
    store: Arc<dyn ObjectStore>,
    remote_root: String,
    scratch_dir: PathBuf,
    ctx: StoreContext,
    clock: Arc<Clock>,
    config: MountConfig,
    uid: u32,
    gid: u32,
}

impl AdapterRoot {
    /// Creates the adapter state, creating the scratch directory (mode 0700).
    ///
    /// `remote_root` gets a trailing `/` if it lacks one.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        remote_root: &str,
        config: MountConfig,
    ) -> FuseResult<Self> {
        let remote_root = objfs_core::path::dir_prefix(remote_root);
        let scratch_dir = config.scratch_dir.clone();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&scratch_dir)?;
        std::fs::set_permissions(&scratch_dir, std::fs::Permissions::from_mode(0o700))?;
        debug!(remote_root = %remote_root, scratch_dir = %scratch_dir.display(), store = store.name(), "Adapter root ready");

        // SAFETY: getuid/getgid have no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        Ok(Self {
            store,
            remote_root,
            scratch_dir,
            ctx: StoreContext::background(),
            clock: Arc::new(Clock::new()),
            config,
            uid,
            gid,
        })
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Remote root path, always ending with `/`.
    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Ambient context passed to every store call.
    pub fn ctx(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Expiration for a value cached now.
    pub fn expires(&self) -> Timestamp {
        self.clock.after(self.config.cache_ttl)
    }

    pub fn is_expired(&self, ts: Timestamp) -> bool {
        self.clock.is_expired(ts)
    }

    pub fn invalidator(&self) -> Invalidator {
        Invalidator::new(Arc::clone(&self.clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objfs_core::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn test_root_normalized_and_scratch_private() {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("nested/scratch");
        let root = AdapterRoot::new(
            Arc::new(MemoryStore::new()),
            "bucket",
            MountConfig::local().scratch_dir(&scratch),
        )
        .unwrap();

        assert_eq!(root.remote_root(), "bucket/");
        let mode = std::fs::metadata(&scratch).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_invalidator_expires_cached_values() {
        let tmp = TempDir::new().unwrap();
        let root = AdapterRoot::new(
            Arc::new(MemoryStore::new()),
            "bucket/",
            MountConfig::default().scratch_dir(tmp.path()),
        )
        .unwrap();
        let ts = root.expires();
        assert!(!root.is_expired(ts));
        root.invalidator().invalidate();
        assert!(root.is_expired(ts));
    }
}
