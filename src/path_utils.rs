//! Backend-relative path handling
//!
//! Paths handed to adapters are always forward-slash and rooted (`/a/b.txt`),
//! independent of the host OS or the backend's native addressing. Adapters
//! map them onto their own root (a directory, a key prefix, a remote folder).

use crate::error::{StorageError, StorageResult};

/// Normalize a backend-relative path.
///
/// - accepts `/` and `\` separators
/// - drops empty and `.` segments
/// - resolves `..` against preceding segments
///
/// A `..` that would climb above the root is rejected with
/// `PermissionDenied`: nothing resolved here may escape the adapter root.
///
/// # Examples
/// ```
/// use polystore::path_utils::normalize;
/// assert_eq!(normalize("a//b/./c").unwrap(), "/a/b/c");
/// assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
/// assert!(normalize("../../etc/passwd").is_err());
/// ```
pub fn normalize(path: &str) -> StorageResult<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::PermissionDenied(format!(
                        "path escapes storage root: {}",
                        path
                    )));
                }
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Check whether a normalized path is the root.
pub fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

/// Join a normalized directory path and a single child name with `/`.
pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Parent of a normalized path. `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    if is_root(path) {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => Some("/".to_string()),
    }
}

/// Last segment of a path (empty for the root).
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Every proper ancestor of `path`, outermost first, excluding the root.
///
/// `/a/b/c.txt` → `["/a", "/a/b"]`
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if is_root(&p) {
            break;
        }
        current = parent(&p);
        out.push(p);
    }
    out.reverse();
    out
}

/// Path relative to `ancestor`, without a leading slash. `None` when `path`
/// is not inside `ancestor`.
pub fn relative_to<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if is_root(ancestor) {
        return Some(path.trim_start_matches('/'));
    }
    let rest = path.strip_prefix(ancestor)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// Check whether `path` equals `ancestor` or lies beneath it.
pub fn is_within(ancestor: &str, path: &str) -> bool {
    relative_to(ancestor, path).is_some()
}

/// Validate an entry name taken from an archive.
///
/// Leading slashes are stripped; drive prefixes and any `..` segment are
/// rejected so a crafted archive cannot write outside the extraction directory.
pub fn sanitize_archive_entry(name: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return None,
            s if s.contains(':') => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize("a\\b\\c").unwrap(), "/a/b/c");
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
    }

    #[test]
    fn test_normalize_rejects_escape() {
        assert!(matches!(
            normalize("../../etc/passwd"),
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(normalize("/a/../../b").is_err());
        assert_eq!(normalize("/a/../b").unwrap(), "/b");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join("/", "home"), "/home");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b/c.txt").as_deref(), Some("/a/b"));
        assert_eq!(parent("/a").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b/c.txt"), vec!["/a", "/a/b"]);
        assert!(ancestors("/top.txt").is_empty());
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("/a", "/a/b/c"), Some("b/c"));
        assert_eq!(relative_to("/a", "/a"), Some(""));
        assert_eq!(relative_to("/a", "/ab/c"), None);
        assert_eq!(relative_to("/", "/x/y"), Some("x/y"));
    }

    #[test]
    fn test_sanitize_archive_entry() {
        assert_eq!(sanitize_archive_entry("dir/file.txt").as_deref(), Some("dir/file.txt"));
        assert_eq!(sanitize_archive_entry("./dir/").as_deref(), Some("dir"));
        assert_eq!(sanitize_archive_entry("/etc/passwd").as_deref(), Some("etc/passwd"));
        assert_eq!(sanitize_archive_entry("../evil"), None);
        assert_eq!(sanitize_archive_entry("a/../../evil"), None);
        assert_eq!(sanitize_archive_entry("C:/windows"), None);
        assert_eq!(sanitize_archive_entry("."), None);
    }
}
