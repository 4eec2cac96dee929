//! HAProxy reload
//!
//! HAProxy in master-worker mode reloads its configuration on `SIGUSR2`. The
//! reloader reads the master PID from the PID file and sends the signal; it
//! does not wait for the reload to complete.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const RELOAD_SIGNAL: &str = "USR2";

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("PID file {0} does not exist")]
    PidFileMissing(PathBuf),

    #[error("Failed to read PID file {path}: {source}")]
    PidFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No valid PID in {path}: {content:?}")]
    InvalidPid { path: PathBuf, content: String },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },
}

#[async_trait]
pub trait ProxyReloader: Send + Sync {
    /// Ask the proxy to reload, returning the PID that was signalled
    async fn reload(&self, pid_file: &Path) -> Result<u32, ReloadError>;
}

/// PID on the first line of a PID file; zero is not a valid PID
pub fn parse_pid(content: &str) -> Option<u32> {
    content
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
}

/// Sends a signal with `kill(1)`
#[derive(Debug, Clone)]
pub struct SignalReloader {
    signal: String,
}

impl SignalReloader {
    pub fn new() -> Self {
        Self::with_signal(RELOAD_SIGNAL)
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
        }
    }
}

impl Default for SignalReloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyReloader for SignalReloader {
    async fn reload(&self, pid_file: &Path) -> Result<u32, ReloadError> {
        let content = match tokio::fs::read_to_string(pid_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ReloadError::PidFileMissing(pid_file.to_path_buf()))
            }
            Err(source) => {
                return Err(ReloadError::PidFileRead {
                    path: pid_file.to_path_buf(),
                    source,
                })
            }
        };

        let pid = parse_pid(&content).ok_or_else(|| ReloadError::InvalidPid {
            path: pid_file.to_path_buf(),
            content: content.trim().to_string(),
        })?;

        debug!("Sending SIG{} to {}", self.signal, pid);

        let output = Command::new("kill")
            .arg(format!("-{}", self.signal))
            .arg(pid.to_string())
            .output()
            .await
            .map_err(|e| ReloadError::Signal {
                pid,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ReloadError::Signal {
                pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(pid)
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
