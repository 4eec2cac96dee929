//! Content-digest change detection
//!
//! An artifact is only written when the SHA-256 digest of what we would write
//! differs from the digest of what is on disk.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::fs::ArtifactFs;

/// Hex-encoded SHA-256 of `content`
pub fn content_digest(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Whether `proposed` differs from the file at `path`.
///
/// A missing file counts as changed unless `proposed` is empty, so empty
/// documents are never written just because nothing exists yet. Existing
/// content is compared as bytes; a file that is not valid UTF-8 differs
/// from any rendered document.
pub fn has_changed(fs: &dyn ArtifactFs, path: &Path, proposed: &str) -> io::Result<bool> {
    match fs.read_if_exists(path)? {
        None => Ok(!proposed.is_empty()),
        Some(existing) => Ok(content_digest(&existing) != content_digest(proposed.as_bytes())),
    }
}
