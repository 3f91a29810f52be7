//! Lexical validation of requested resource paths.
//!
//! These checks operate on the raw, un-normalized request string and never
//! touch the filesystem. They run before any path joining or canonicalization
//! so that a normalization quirk can never turn a traversal attempt into an
//! accepted path.
//!
//! The filesystem half of path resolution lives in
//! [`crate::security::path_guard`].

use std::fmt;
use std::path::Path;

/// Parent-directory marker. Any occurrence is rejected, not only whole segments.
const PARENT_MARKER: &str = "..";

/// Reason a requested path failed lexical validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalRejection {
    /// Contains a `..` sequence.
    ParentReference,
    /// Starts with `/`, `\` or a drive prefix such as `C:`.
    AbsolutePath,
    /// Contains a NUL byte.
    NulByte,
}

impl fmt::Display for LexicalRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexicalRejection::ParentReference => write!(f, "parent directory reference"),
            LexicalRejection::AbsolutePath => write!(f, "absolute path"),
            LexicalRejection::NulByte => write!(f, "NUL byte"),
        }
    }
}

/// Validate a requested path before it is joined onto the static root.
///
/// Rules:
/// - Must not contain `..` anywhere (stricter than segment matching)
/// - Must not begin with a root anchor (`/`, `\`, `X:`)
/// - Must not contain NUL bytes
pub fn check_requested_path(path: &str) -> Result<(), LexicalRejection> {
    if path.contains('\0') {
        return Err(LexicalRejection::NulByte);
    }

    if path.contains(PARENT_MARKER) {
        return Err(LexicalRejection::ParentReference);
    }

    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path) {
        return Err(LexicalRejection::AbsolutePath);
    }

    Ok(())
}

/// Returns `true` for Windows-style drive prefixes such as `C:` or `c:\`.
fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

/// Extract the lowercased extension of a requested path, including the dot.
///
/// Returns `None` when the final component has no extension (`README`,
/// `.htaccess`) so the caller can reject it.
pub fn file_extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
}

/// Normalize a configured extension: trims, lowercases and ensures a leading dot.
///
/// Returns `None` for empty entries.
pub fn normalize_extension(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!(".{}", trimmed.to_ascii_lowercase()))
}

/// Content type for a served asset, keyed by lowercased extension.
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        ".html" | ".htm" => "text/html; charset=utf-8",
        ".css" => "text/css; charset=utf-8",
        ".js" => "text/javascript; charset=utf-8",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        ".webp" => "image/webp",
        ".txt" => "text/plain; charset=utf-8",
        ".json" => "application/json",
        _ => "application/octet-stream",
    }
}
