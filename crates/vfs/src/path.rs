//! Path helpers.
//!
//! VFS paths are relative to the mount root, `/`-separated, with no leading
//! or trailing slash. The root is the empty string.

/// Normalize a caller-supplied path.
///
/// Drops empty and `.` components and folds `..` lexically. `..` at the root
/// stays at the root.
///
/// # Arguments
/// * `path` - Raw path, with or without leading `/`
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Split a path into parent directory and name.
///
/// # Returns
/// (parent_path, name) tuple.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Join a directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Resolve a symlink target against the link's location.
///
/// Relative targets resolve from the directory holding the link; absolute
/// targets are rooted at the mount root.
///
/// # Arguments
/// * `link_path` - Normalized path of the link itself
/// * `target` - Raw target string stored in the link
pub fn resolve_link_target(link_path: &str, target: &str) -> String {
    if target.starts_with('/') {
        return normalize(target);
    }
    let (parent, _) = split_path(link_path);
    normalize(&join(parent, target))
}

/// Check whether `path` equals `ancestor` or lies below it.
pub fn is_same_or_descendant(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Check that a single path component can name a new entry.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
