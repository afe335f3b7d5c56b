//! Object store backed by a local directory tree.
//!
//! Paths handed to [`LocalStore`] are ordinary filesystem paths. Directories
//! are real directories, so a name can never be both a file and a directory.
//! Writes go to a temporary file next to the destination and are renamed
//! into place on commit.

use crate::context::StoreContext;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::store::{FileInfo, ListEntry, Listing, ObjectStore, ReadStream, WriteStream};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::trace;
use walkdir::WalkDir;

/// A store over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }
}

fn info_of(md: &Metadata) -> FileInfo {
    FileInfo {
        size: md.len(),
        mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    fn stat(&self, ctx: &StoreContext, path: &str) -> StoreResult<FileInfo> {
        ctx.check("stat", path)?;
        let md = fs::metadata(path).map_err(|e| StoreError::from_io("stat", path, e))?;
        if md.is_dir() {
            return Err(StoreError::new(ErrorKind::Invalid, "stat", path));
        }
        Ok(info_of(&md))
    }

    fn open(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn ReadStream>> {
        ctx.check("open", path)?;
        let file = File::open(path).map_err(|e| StoreError::from_io("open", path, e))?;
        let md = file
            .metadata()
            .map_err(|e| StoreError::from_io("open", path, e))?;
        if md.is_dir() {
            return Err(StoreError::new(ErrorKind::Invalid, "open", path));
        }
        Ok(Box::new(LocalReader { file }))
    }

    fn create(&self, ctx: &StoreContext, path: &str) -> StoreResult<Box<dyn WriteStream>> {
        ctx.check("create", path)?;
        let dest = PathBuf::from(path);
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| StoreError::from_io("create", path, e))?;
        let tmp = NamedTempFile::new_in(parent).map_err(|e| StoreError::from_io("create", path, e))?;
        trace!(path, tmp = %tmp.path().display(), "Local write started");
        Ok(Box::new(LocalWriter { tmp, dest }))
    }

    fn list(&self, ctx: &StoreContext, path: &str, recursive: bool) -> StoreResult<Listing> {
        ctx.check("list", path)?;
        let md = match fs::metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(StoreError::from_io("list", path, e)),
        };
        if !md.is_dir() {
            // A file lists as itself, never as a directory.
            let entry = ListEntry::file(path.trim_end_matches('/'), info_of(&md));
            return Ok(Box::new(std::iter::once(Ok(entry))));
        }

        let mut walker = WalkDir::new(path).min_depth(1).sort_by_file_name();
        if !recursive {
            walker = walker.max_depth(1);
        }
        Ok(Box::new(LocalListing {
            walker: walker.into_iter(),
            recursive,
            ctx: ctx.clone(),
            path: path.to_string(),
            failed: false,
        }))
    }

    fn remove(&self, ctx: &StoreContext, path: &str) -> StoreResult<()> {
        ctx.check("remove", path)?;
        fs::remove_file(path).map_err(|e| StoreError::from_io("remove", path, e))
    }
}

struct LocalListing {
    walker: walkdir::IntoIter,
    recursive: bool,
    ctx: StoreContext,
    path: String,
    failed: bool,
}

impl Iterator for LocalListing {
    type Item = StoreResult<ListEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Err(e) = self.ctx.check("list", &self.path) {
                self.failed = true;
                return Some(Err(e));
            }
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map_or_else(|| self.path.clone(), |p| p.to_string_lossy().into_owned());
                    let io_err = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop"));
                    // Entries removed while walking are skipped.
                    if io_err.kind() == io::ErrorKind::NotFound {
                        continue;
                    }
                    self.failed = true;
                    return Some(Err(StoreError::from_io("list", path, io_err)));
                }
            };

            let entry_path = entry.path().to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                if self.recursive {
                    continue;
                }
                return Some(Ok(ListEntry::dir(entry_path)));
            }
            match entry.metadata() {
                Ok(md) => return Some(Ok(ListEntry::file(entry_path, info_of(&md)))),
                Err(e) => {
                    let io_err = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("metadata unavailable"));
                    if io_err.kind() == io::ErrorKind::NotFound {
                        continue;
                    }
                    self.failed = true;
                    return Some(Err(StoreError::from_io("list", entry_path, io_err)));
                }
            }
        }
    }
}

struct LocalReader {
    file: File,
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadStream for LocalReader {
    fn close(self: Box<Self>, _ctx: &StoreContext) -> StoreResult<()> {
        Ok(())
    }
}

struct LocalWriter {
    tmp: NamedTempFile,
    dest: PathBuf,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tmp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

impl WriteStream for LocalWriter {
    fn close(mut self: Box<Self>, ctx: &StoreContext) -> StoreResult<()> {
        let dest = self.dest.to_string_lossy().into_owned();
        ctx.check("create", &dest)?;
        self.tmp
            .flush()
            .map_err(|e| StoreError::from_io("create", dest.clone(), e))?;
        let LocalWriter { tmp, dest: dest_path } = *self;
        tmp.persist(&dest_path)
            .map_err(|e| StoreError::from_io("create", dest, e.error))?;
        Ok(())
    }

    fn discard(self: Box<Self>) {
        trace!(path = %self.dest.display(), "Local write discarded");
    }
}
