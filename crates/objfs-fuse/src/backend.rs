//! Mounting and unmounting.
//!
//! [`FuseBackend::mount`] starts a background FUSE session for an
//! [`Adapter`] and waits until the kernel reports the mount. The returned
//! [`FuseMountHandle`] unmounts when dropped.

use crate::filesystem::{Adapter, ObjectFs};
use fuser::{BackgroundSession, MountOption};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from mounting.
#[derive(Debug, Error)]
pub enum MountError {
    /// FUSE is not installed or not loaded.
    #[error("FUSE backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The mount syscall or readiness check failed.
    #[error("Mount failed: {0}")]
    Mount(#[from] io::Error),
}

/// Timeout for graceful session.join() before forcing unmount.
/// Thread may leak on timeout, but this is acceptable vs blocking forever.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a mounted filesystem.
///
/// Wraps the fuser `BackgroundSession`. Dropping this handle triggers unmount.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
    adapter: Adapter,
}

impl std::fmt::Debug for FuseMountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("mounted", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl FuseMountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// The adapter serving this mount, for invalidation and cancellation.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Whether the mount is still in place. False once unmounted externally.
    pub fn is_mounted(&self) -> bool {
        self.session.is_some() && is_mount_point(&self.mountpoint)
    }

    /// Unmounts and waits for the session to end. May block while files
    /// are open.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            session.join();
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }

    /// Force unmount the filesystem using system tools.
    /// This is a fallback when the normal unmount is blocked.
    fn force_unmount_impl(&self) {
        #[cfg(target_os = "macos")]
        {
            let result = std::process::Command::new("diskutil")
                .args(["unmount", "force"])
                .arg(&self.mountpoint)
                .output();
            match result {
                Ok(output) if output.status.success() => {
                    tracing::debug!("Force unmount via diskutil succeeded");
                    return;
                }
                _ => tracing::debug!("diskutil unmount failed, trying umount"),
            }
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(&self.mountpoint)
                .output();
        }

        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("fusermount")
                .args(["-uz"])
                .arg(&self.mountpoint)
                .output();
        }
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!("Unmounting FUSE filesystem at {}", self.mountpoint.display());

            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                session.join();
                let _ = tx.send(());
            });

            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(()) => tracing::debug!("Graceful unmount completed for {}", self.mountpoint.display()),
                Err(_) => {
                    tracing::warn!(
                        "session.join() timed out after {:?} for {}, forcing unmount",
                        JOIN_TIMEOUT,
                        self.mountpoint.display()
                    );
                    self.force_unmount_impl();
                }
            }
        }
    }
}

/// FUSE mounting backend.
#[derive(Debug, Clone, Copy)]
pub struct FuseBackend {
    /// Timeout for waiting for mount readiness
    pub mount_timeout: Duration,
    /// Polling interval when waiting for mount
    pub poll_interval: Duration,
}

impl Default for FuseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FuseBackend {
    pub fn new() -> Self {
        Self {
            mount_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_timeouts(mount_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            mount_timeout,
            poll_interval,
        }
    }

    /// Whether the FUSE kernel side is present.
    pub fn is_available(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            Path::new("/Library/Filesystems/macfuse.fs").exists()
        }
        #[cfg(target_os = "linux")]
        {
            Path::new("/dev/fuse").exists()
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            false
        }
    }

    /// Mount options for a store named `store_name`.
    pub fn mount_options(store_name: &str) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(format!("objfs:{store_name}")),
            MountOption::Subtype("objfs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
            MountOption::NoAtime,
        ];
        #[cfg(target_os = "macos")]
        options.push(MountOption::CUSTOM("daemon_timeout=30".to_string()));
        options
    }

    /// Mounts `adapter` at `mountpoint`, creating the directory if needed.
    pub fn mount(&self, adapter: Adapter, mountpoint: &Path) -> Result<FuseMountHandle, MountError> {
        if !self.is_available() {
            return Err(MountError::BackendUnavailable(
                "FUSE is not available. Ensure the fuse kernel module (or macFUSE) is installed."
                    .to_string(),
            ));
        }
        if !mountpoint.exists() {
            std::fs::create_dir_all(mountpoint)?;
        }

        let options = Self::mount_options(adapter.store_name());
        let fs = ObjectFs::new(adapter.clone())?;
        let session = self.spawn_mount_with_timeout(fs, mountpoint, &options)?;
        self.wait_for_mount(mountpoint)?;

        tracing::info!(
            mountpoint = %mountpoint.display(),
            store = adapter.store_name(),
            "FUSE mount successful"
        );
        Ok(FuseMountHandle {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
            adapter,
        })
    }

    /// Polls until the mount point's device differs from its parent's.
    fn wait_for_mount(&self, mount_point: &Path) -> io::Result<()> {
        let deadline = Instant::now() + self.mount_timeout;
        while Instant::now() < deadline {
            if is_mount_point(mount_point) {
                tracing::debug!(mountpoint = %mount_point.display(), "FUSE mount confirmed active");
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }

        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("FUSE mount did not become ready within {:?}", self.mount_timeout),
        ))
    }

    /// Runs spawn_mount2 on a helper thread so a mount syscall blocked by a
    /// stale mount cannot hang the caller.
    fn spawn_mount_with_timeout(
        &self,
        fs: ObjectFs,
        mountpoint: &Path,
        options: &[MountOption],
    ) -> io::Result<BackgroundSession> {
        let mountpoint = mountpoint.to_path_buf();
        let options = options.to_vec();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
        });

        match rx.recv_timeout(self.mount_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Mount operation timed out - the mountpoint may be on a stale FUSE mount",
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(io::Error::other("Mount thread terminated unexpectedly"))
            }
        }
    }
}

/// A mount is detected when the path's device ID differs from its parent's.
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let parent = path.parent().unwrap_or(Path::new("/"));
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(meta), Ok(parent_meta)) => meta.dev() != parent_meta.dev(),
        _ => false,
    }
}
