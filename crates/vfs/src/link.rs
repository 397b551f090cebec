//! Symlink encoding on backends without native links.
//!
//! A link is stored as an ordinary object whose key carries [`LINK_SUFFIX`]
//! and whose content is the target path, UTF-8, with no terminator. The
//! logical name seen by filesystem callers has the suffix stripped.
//!
//! The suffix is a persisted naming convention shared with other readers of
//! the same bucket, so it is matched exactly and case-sensitively.

use crate::VfsError;

/// Reserved suffix marking an object as an encoded symlink.
pub const LINK_SUFFIX: &str = ".rclonelink";

/// Encode a symlink target as object content.
pub fn encode(target: &str) -> Vec<u8> {
    target.as_bytes().to_vec()
}

/// Decode object content into a symlink target.
///
/// # Arguments
/// * `key` - Object key, used for error reporting
/// * `data` - Object content
pub fn decode(key: &str, data: Vec<u8>) -> Result<String, VfsError> {
    String::from_utf8(data).map_err(|_| VfsError::InvalidSymlink(key.to_string()))
}

/// Check whether an object name denotes an encoded symlink.
///
/// A name consisting of the suffix alone has no logical name and is not a
/// link.
pub fn is_symlink_object_name(name: &str) -> bool {
    name.len() > LINK_SUFFIX.len() && name.ends_with(LINK_SUFFIX)
}

/// Strip the link suffix from a tagged name.
///
/// Names without the suffix are returned unchanged.
pub fn to_logical_name(tagged: &str) -> &str {
    if is_symlink_object_name(tagged) {
        &tagged[..tagged.len() - LINK_SUFFIX.len()]
    } else {
        tagged
    }
}

/// Append the link suffix to a logical name or path.
pub fn to_backend_name(logical: &str) -> String {
    format!("{}{}", logical, LINK_SUFFIX)
}
