//! `objfs`: mount a directory tree served through the object store adapter.
//!
//! Runs in the foreground until SIGINT or SIGTERM. SIGHUP expires every
//! cached attribute and listing without unmounting.

use anyhow::{Context, Result};
use clap::Parser;
use objfs_core::LocalStore;
use objfs_fuse::{Adapter, FuseBackend, MountConfig};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::consts::signal::SIGHUP;
use signal_hook::flag;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SIGNAL_POLL: Duration = Duration::from_millis(100);
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    name = "objfs",
    version,
    about = "Mount an object store as a FUSE filesystem",
    after_help = "objfs stays in the foreground until SIGINT or SIGTERM and has no daemon mode. \
                  Run it under a service manager to keep it in the background. \
                  SIGHUP expires cached attributes and listings."
)]
struct Cli {
    /// Directory to mount on (created if missing)
    mountpoint: PathBuf,

    /// Root of the object key space exposed at the mount point
    #[arg(long, env = "OBJFS_REMOTE_ROOT")]
    remote_root: String,

    /// Private directory for write scratch files [default: /tmp/objfs-cache-<euid>]
    #[arg(long, env = "OBJFS_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Write logs to objfs.log in this directory instead of stderr
    #[arg(long, env = "OBJFS_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long)]
    debug: bool,

    /// Lifetime of cached attributes and listings, in seconds
    #[arg(long, value_name = "SECS")]
    cache_ttl: Option<u64>,

    /// Worker threads serving filesystem calls [default: number of CPUs]
    #[arg(long)]
    threads: Option<usize>,
}

fn setup_tracing(debug: bool, log_dir: Option<&Path>) -> Result<()> {
    let filter = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join("objfs.log");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            info!(path = %path.display(), "Logging to file");
        }
        None => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
    }
    Ok(())
}

fn mount_config(cli: &Cli) -> MountConfig {
    let mut config = MountConfig::default();
    if let Some(secs) = cli.cache_ttl {
        let ttl = Duration::from_secs(secs);
        config = config.cache_ttl(ttl).kernel_ttl(ttl);
    }
    if let Some(threads) = cli.threads {
        config = config.worker_threads(threads);
    }
    if let Some(dir) = &cli.scratch_dir {
        config = config.scratch_dir(dir);
    }
    config
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.debug, cli.log_dir.as_deref())?;

    let config = mount_config(&cli);
    info!(
        remote_root = %cli.remote_root,
        mountpoint = %cli.mountpoint.display(),
        scratch_dir = %config.scratch_dir.display(),
        "Starting objfs"
    );

    let adapter = Adapter::new(Arc::new(LocalStore::new()), &cli.remote_root, config)
        .context("Failed to initialize filesystem")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for &sig in TERM_SIGNALS {
        // A second signal exits immediately.
        flag::register_conditional_shutdown(sig, 1, Arc::clone(&shutdown))?;
        flag::register(sig, Arc::clone(&shutdown))?;
    }
    let hangup = Arc::new(AtomicBool::new(false));
    flag::register(SIGHUP, Arc::clone(&hangup))?;

    let handle = FuseBackend::new()
        .mount(adapter, &cli.mountpoint)
        .with_context(|| format!("Failed to mount at {}", cli.mountpoint.display()))?;
    let invalidator = handle.adapter().invalidator();

    let mut last_check = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        if hangup.swap(false, Ordering::Relaxed) {
            info!("Received SIGHUP");
            invalidator.invalidate();
        }
        if last_check.elapsed() >= MOUNT_CHECK_INTERVAL {
            last_check = Instant::now();
            if !handle.is_mounted() {
                info!("Filesystem was unmounted externally");
                break;
            }
        }
        std::thread::sleep(SIGNAL_POLL);
    }

    info!("Shutting down");
    drop(handle);
    Ok(())
}
