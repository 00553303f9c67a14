//! Routing prefix rules.
//!
//! Prefixes are absolute, normalized paths compared on whole segments:
//! `/admin/v1/modules/ipam` matches `/admin/v1/modules/ipam/v1/subnets` but
//! not `/admin/v1/modules/ipam2`.

use crate::{Error, Result};

fn invalid(prefix: &str, reason: impl Into<String>) -> Error {
    Error::InvalidPrefix {
        prefix: prefix.to_string(),
        reason: reason.into(),
    }
}

fn check_syntax(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(invalid(path, "must start with '/'"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(invalid(path, "must not end with '/'"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(invalid(path, "empty path segment")),
            "." | ".." => return Err(invalid(path, "dot segments are not allowed")),
            s if !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')) =>
            {
                return Err(invalid(
                    path,
                    format!("segment '{s}' contains characters outside [A-Za-z0-9-_.~]"),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate the router's module root (e.g. `/admin/v1/modules`)
///
/// # Errors
///
/// Returns `Error::InvalidPrefix` if the root is not a normalized path.
pub fn validate_root(root: &str) -> Result<()> {
    if root == "/" {
        return Err(invalid(root, "module root must not be '/'"));
    }
    check_syntax(root)
}

/// Validate a module prefix: normalized and strictly below `root`
///
/// # Errors
///
/// Returns `Error::InvalidPrefix` describing the first violated rule.
pub fn validate(prefix: &str, root: &str) -> Result<()> {
    check_syntax(prefix)?;
    if prefix == root || !is_segment_prefix(root, prefix) {
        return Err(invalid(prefix, format!("must be below '{root}'")));
    }
    Ok(())
}

/// Whether `prefix` covers `path` on whole segments
#[must_use]
pub fn is_segment_prefix(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Whether two distinct prefixes are ancestor/descendant of each other
#[must_use]
pub fn overlaps(a: &str, b: &str) -> bool {
    a != b && (is_segment_prefix(a, b) || is_segment_prefix(b, a))
}

/// Path left after removing `prefix`; always starts with `/`
#[must_use]
pub fn strip<'a>(prefix: &str, path: &'a str) -> &'a str {
    match path.strip_prefix(prefix) {
        Some("") | None => "/",
        Some(rest) => rest,
    }
}

/// Segment-aligned ancestors of `path`, longest first, including `path`
pub fn candidates(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_end_matches('/');
    std::iter::successors(Some(trimmed), |p| {
        p.rfind('/').filter(|i| *i > 0).map(|i| &p[..i])
    })
    .filter(|p| !p.is_empty())
}

/// Whether a request path contains `.` or `..` segments
#[must_use]
pub fn has_dot_segments(path: &str) -> bool {
    path.split('/').any(|s| s == "." || s == "..")
}
