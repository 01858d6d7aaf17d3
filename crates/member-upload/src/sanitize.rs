//! Helpers for sanitizing data before it enters log lines and span attributes.
//!
//! Uploaded files carry personal data (national identifiers, phone numbers),
//! and drop-folder paths can reveal who uploaded what. These functions keep
//! traces shareable for debugging.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Masks a national identifier, keeping only the last four characters.
///
/// - `8001015009087` → `*********9087`
/// - `123` → `***`
pub fn mask_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

/// Returns a short deterministic hash of a path for correlation without
/// exposing the actual path.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let hash = hasher.finish();
    format!("{:016x}", hash)
}

/// Deterministic hash over a path and an extra discriminator (e.g. mtime).
pub fn hash_path_with(path: &Path, extra: u128) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    extra.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
