//! Helpers for slash-separated remote paths.
//!
//! Remote paths are plain strings. A directory is a prefix; its listing
//! prefix always ends with `/`.

/// Joins a directory path and a child name with exactly one `/`.
pub fn join(dir: &str, name: &str) -> String {
    let mut out = String::with_capacity(dir.len() + name.len() + 1);
    out.push_str(dir);
    if !dir.ends_with('/') {
        out.push('/');
    }
    out.push_str(name);
    out
}

/// Returns `path` with a trailing `/`.
pub fn dir_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Returns the immediate child name of `path` under `prefix`.
///
/// `prefix` must end with `/`. A trailing `/` on `path` (a listed
/// subdirectory) is stripped. Returns `None` for paths outside the prefix,
/// for the prefix itself (a directory marker), and for deeper descendants.
pub fn child_name<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let suffix = path.strip_prefix(prefix)?;
    let suffix = suffix.strip_suffix('/').unwrap_or(suffix);
    if suffix.is_empty() || suffix.contains('/') {
        return None;
    }
    Some(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("bucket/", "a"), "bucket/a");
        assert_eq!(join("bucket/dir", "a"), "bucket/dir/a");
        assert_eq!(join("/", "a"), "/a");
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix("bucket/dir"), "bucket/dir/");
        assert_eq!(dir_prefix("bucket/dir/"), "bucket/dir/");
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name("b/d/", "b/d/x"), Some("x"));
        assert_eq!(child_name("b/d/", "b/d/sub/"), Some("sub"));
        assert_eq!(child_name("b/d/", "b/d/"), None);
        assert_eq!(child_name("b/d/", "b/d/sub/x"), None);
        assert_eq!(child_name("b/d/", "b/other"), None);
    }

    mod prop {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn joined_child_is_recovered(dir in "[a-z]{1,8}(/[a-z]{1,8}){0,3}/?", name in "[a-z0-9._-]{1,16}") {
                let child = join(&dir, &name);
                prop_assert_eq!(child_name(&dir_prefix(&dir), &child), Some(name.as_str()));
            }
        }
    }
}
