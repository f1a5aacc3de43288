//! Attachment path resolution.
//!
//! The datastore's stored filename may be home-relative (`~/Library/...`),
//! attachments-root-relative, or already absolute. This resolver expands
//! tildes against the process's actual home directory (never assumes the
//! configured root's parent is home), joins relative paths under the
//! configured attachments root, canonicalises, and guards against
//! path-traversal by requiring the canonical path to share the root prefix.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentPathError {
    #[error("could not determine home directory to expand '~'")]
    NoHomeDirectory,
    #[error("attachment path does not exist")]
    NotFound,
    #[error("resolved path escapes the attachments root")]
    PathTraversal,
}

/// Resolve a stored attachment path to an absolute path, or `None` if the
/// file does not exist or escapes the attachments root (per
/// `AttachmentPathError`, collapsed to `None` for the caller since a missing
/// attachment is not fatal to forwarding the message).
pub fn resolve_attachment_path(stored: &str, attachments_root: &str) -> Option<String> {
    try_resolve(stored, attachments_root).ok()
}

fn try_resolve(stored: &str, attachments_root: &str) -> Result<String, AttachmentPathError> {
    let root = Path::new(attachments_root);
    let candidate = if let Some(rest) = stored.strip_prefix('~') {
        let home = home_dir().ok_or(AttachmentPathError::NoHomeDirectory)?;
        home.join(rest.trim_start_matches('/'))
    } else {
        let p = Path::new(stored);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    let canonical = candidate
        .canonicalize()
        .map_err(|_| AttachmentPathError::NotFound)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|_| AttachmentPathError::NotFound)?;

    if !canonical.starts_with(&canonical_root) {
        return Err(AttachmentPathError::PathTraversal);
    }

    Ok(canonical.to_string_lossy().into_owned())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
