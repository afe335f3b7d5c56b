//! Node identity and attribute construction.
//!
//! Inode numbers are a pure function of the full remote path, so the same
//! object keeps its inode across lookups, listings and remounts.

use fuser::{FileAttr, FileType};
use sha2::{Digest, Sha512_256};
use std::time::SystemTime;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Block size advertised for every node (1 MiB).
pub const BLOCK_SIZE: u32 = 1 << 20;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

/// Stable 64-bit identity of a remote path.
///
/// The first 8 bytes of the SHA-512/256 digest, little endian.
pub fn identity_of(path: &str) -> u64 {
    let digest = Sha512_256::digest(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// POSIX mode word for a directory (`0755`) or regular file (`0644`).
pub fn mode_of(is_dir: bool) -> u32 {
    if is_dir { S_IFDIR | 0o755 } else { S_IFREG | 0o644 }
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn file_type(mode: u32) -> FileType {
    if is_dir_mode(mode) {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

/// Builds kernel attributes.
///
/// Link count is always 1 and atime/ctime/crtime mirror `mtime`.
pub fn file_attr(ino: u64, mode: u32, size: u64, mtime: SystemTime, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type(mode),
        perm: (mode & 0o7777) as u16,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_identity_is_deterministic() {
        assert_eq!(identity_of("bucket/a/b"), identity_of("bucket/a/b"));
        assert_ne!(identity_of("bucket/a/b"), identity_of("bucket/a/c"));
    }

    #[test]
    fn test_identity_known_value() {
        // SHA-512/256("") starts with c6 72 b8 d1 ef 56 ed 28
        assert_eq!(identity_of(""), 0x28ed_56ef_d1b8_72c6);
    }

    #[test]
    fn test_modes() {
        assert_eq!(mode_of(true), 0o040_755);
        assert_eq!(mode_of(false), 0o100_644);
        assert!(is_dir_mode(mode_of(true)));
        assert_eq!(file_type(mode_of(false)), FileType::RegularFile);
    }

    #[test]
    fn test_file_attr_blocks() {
        let attr = file_attr(7, mode_of(false), u64::from(BLOCK_SIZE) + 1, UNIX_EPOCH, 1, 2);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.blksize, BLOCK_SIZE);
        assert_eq!(file_attr(7, mode_of(false), 0, UNIX_EPOCH, 1, 2).blocks, 0);
    }

    proptest! {
        #[test]
        fn identity_depends_only_on_path(path in "[a-z/._-]{0,64}") {
            prop_assert_eq!(identity_of(&path), identity_of(&path.clone()));
        }
    }
}
