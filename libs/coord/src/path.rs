//! Path helpers for `/`-separated store paths.

use crate::{CoordError, CoordResult};

/// Joins path components, collapsing duplicate separators.
///
/// ```
/// use shoal_coord::path::join;
/// assert_eq!(join(&["/pools", "p1", "hosts/"]), "/pools/p1/hosts");
/// assert_eq!(join(&["/", ""]), "/");
/// ```
pub fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for segment in parts.iter().flat_map(|p| p.split('/')) {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Returns the parent of an absolute path, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Returns the last component of a path.
pub fn base(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Checks that a path is absolute, has no empty components and no trailing
/// separator.
pub fn validate(path: &str) -> CoordResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(())
}
