//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which mounts a temporary local directory through
//! the object store adapter and unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use objfs_core::LocalStore;
use objfs_fuse::{Adapter, FuseBackend, FuseMountHandle, MountConfig};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// How long to wait for mount to become ready.
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait between mount readiness checks.
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A mounted temporary directory for testing.
///
/// # Example
///
/// ```ignore
/// use common::TestMount;
///
/// #[test]
/// fn test_write_read() {
///     let mount = TestMount::with_temp_store().unwrap();
///     mount.write("test.txt", b"hello").unwrap();
///     assert_eq!(mount.read("test.txt").unwrap(), b"hello");
/// }
/// ```
pub struct TestMount {
    /// The mounted session (unmounts on drop). Declared first so it drops
    /// before the directories it points at.
    handle: FuseMountHandle,
    /// Path where the store is mounted.
    pub mount_path: PathBuf,
    /// Backing directory the store serves.
    store_dir: TempDir,
    /// Scratch files for buffered writes.
    _scratch: TempDir,
    /// Temporary mount point directory.
    _temp_mount: TempDir,
}

impl TestMount {
    /// Mounts a fresh empty directory with one-second cache lifetimes.
    pub fn with_temp_store() -> Result<Self, String> {
        Self::with_config(MountConfig::local())
    }

    /// Mounts a fresh empty directory with `config`. The scratch directory
    /// is always replaced with a temporary one.
    pub fn with_config(config: MountConfig) -> Result<Self, String> {
        let store_dir = TempDir::new().map_err(|e| format!("Failed to create store dir: {e}"))?;
        let scratch = TempDir::new().map_err(|e| format!("Failed to create scratch dir: {e}"))?;
        let temp_mount = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = temp_mount.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let remote_root = store_dir
            .path()
            .to_str()
            .ok_or("store dir is not UTF-8")?
            .to_string();
        let adapter = Adapter::new(
            Arc::new(LocalStore::new()),
            &remote_root,
            config.scratch_dir(scratch.path()),
        )
        .map_err(|e| format!("Failed to create adapter: {e}"))?;

        let backend = FuseBackend::with_timeouts(MOUNT_READY_TIMEOUT, MOUNT_CHECK_INTERVAL);
        let handle = backend
            .mount(adapter, &mount_path)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        // The kernel can report the mount before the first request is served.
        thread::sleep(Duration::from_millis(100));

        Ok(Self {
            handle,
            mount_path,
            store_dir,
            _scratch: scratch,
            _temp_mount: temp_mount,
        })
    }

    pub fn adapter(&self) -> &Adapter {
        self.handle.adapter()
    }

    // =========================================================================
    // Filesystem convenience methods
    // =========================================================================

    /// Build a full path from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Path of `relative` in the backing directory, bypassing the mount.
    pub fn backing(&self, relative: &str) -> PathBuf {
        self.store_dir.path().join(relative.trim_start_matches('/'))
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        File::open(self.path(path))?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Write content to a file (creates or overwrites).
    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    /// Append content to a file.
    pub fn append(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    /// Remove a file.
    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.path(path))
    }

    /// Check if a path exists.
    pub fn exists(&self, path: &str) -> bool {
        self.path(path).exists()
    }

    /// Check if a path is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        self.path(path).is_dir()
    }

    /// Get file/directory metadata.
    pub fn metadata(&self, path: &str) -> io::Result<Metadata> {
        fs::metadata(self.path(path))
    }

    /// List directory entries (names only), sorted.
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let entries = fs::read_dir(self.path(path))?;
        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Truncate a file to a specific size.
    pub fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.path(path))?;
        file.set_len(size)?;
        Ok(())
    }
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    FuseBackend::new().is_available()
}

/// Asserts that `path` under the mount reads back as `expected`.
pub fn assert_file_content(mount: &TestMount, path: &str, expected: &[u8]) {
    let actual = mount
        .read(path)
        .unwrap_or_else(|e| panic!("Failed to read {path}: {e}"));
    assert_eq!(
        actual,
        expected,
        "Content mismatch for {path}: got {} bytes, expected {}",
        actual.len(),
        expected.len()
    );
}

/// Asserts the size the kernel reports for `path`.
pub fn assert_file_size(mount: &TestMount, path: &str, expected: u64) {
    let md = mount
        .metadata(path)
        .unwrap_or_else(|e| panic!("Failed to stat {path}: {e}"));
    assert_eq!(md.len(), expected, "Size mismatch for {path}");
}

/// Waits out the kernel and node cache lifetimes of a local mount.
pub fn wait_for_cache_expiry() {
    thread::sleep(Duration::from_millis(1500));
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
