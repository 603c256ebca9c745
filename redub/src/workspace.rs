//! Per-run working directories.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::Result;

/// Create a fresh, uniquely named directory under `root` for one run.
///
/// The name combines the process id and a nanosecond timestamp so that
/// concurrent runs, even within one process, never share a directory.
pub fn make_session_dir(root: &Path) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut dir = root.join(format!("session-{}-{nanos}", std::process::id()));
    let mut suffix = 0u32;
    while dir.exists() {
        suffix += 1;
        dir = root.join(format!("session-{}-{nanos}-{suffix}", std::process::id()));
    }
    std::fs::create_dir_all(&dir)?;
    debug!(path = %dir.display(), "session directory created");
    Ok(dir)
}

/// Remove a directory tree, logging instead of failing.
pub fn safe_remove(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "session directory removed"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to clean up session dir"),
    }
}

/// RAII guard that removes a session directory when dropped, unless kept.
#[derive(Debug)]
pub struct SessionDir {
    path: PathBuf,
    keep: bool,
}

impl SessionDir {
    pub fn create(root: &Path) -> Result<Self> {
        Ok(Self {
            path: make_session_dir(root)?,
            keep: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk after drop.
    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        if !self.keep {
            safe_remove(&self.path);
        }
    }
}
