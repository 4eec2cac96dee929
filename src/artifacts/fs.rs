//! File-system access for artifacts
//!
//! Everything the reconciliation cycle does to disk goes through
//! [`ArtifactFs`], so tests can swap in a failing implementation.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

pub trait ArtifactFs: Send + Sync {
    /// Raw file content, `None` if it does not exist
    fn read_if_exists(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn is_file(&self, path: &Path) -> bool;

    /// Files directly inside `dir`; empty if the directory is missing
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`ArtifactFs`] over the local file system
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl ArtifactFs for LocalFs {
    fn read_if_exists(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes through a sibling temp file and a rename, so readers never see
    /// a partially written artifact.
    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?;
        let tmp = path.with_file_name(format!(".{}.plimni-tmp", file_name.to_string_lossy()));

        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}
