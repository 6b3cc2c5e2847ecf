//! Filename sanitization for incoming transfers.
//!
//! A `FileStart` filename is attacker-controlled: it may carry path
//! traversal, separators, or control characters. Before the name reaches
//! the persistence sink it is reduced to a flat, safe basename:
//!
//! - `..` sequences are removed outright
//! - only alphanumerics, `.`, `-`, and `_` survive (separators vanish)
//! - names that reduce to empty, `.`, or `..` are rejected
//! - names longer than [`MAX_FILENAME_LEN`] are rejected

/// Maximum accepted filename length after sanitization.
pub const MAX_FILENAME_LEN: usize = 255;

/// Sanitize a filename from the wire. Returns `None` when no acceptable
/// name remains.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let without_traversal = raw.replace("..", "");

    let cleaned: String = without_traversal
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    if cleaned.len() > MAX_FILENAME_LEN {
        return None;
    }

    Some(cleaned)
}
