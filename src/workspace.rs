//! Per-message temporary workspace.
//!
//! Every scanned message owns one directory holding the attachment bytes
//! and every intermediate conversion output. The directory is removed when
//! the scan finishes unless the retention policy keeps it for diagnostics.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::KeepWorkspace;

/// Owns the scratch directory for one message scan.
///
/// Dropping the workspace removes the directory; `finish` applies the
/// retention policy instead. The global timeout path simply drops the
/// value, which guarantees cleanup.
pub struct TempWorkspace {
    dir: Option<TempDir>,
    keep: KeepWorkspace,
    errors: u32,
}

impl TempWorkspace {
    pub fn create(base: Option<&Path>, keep: KeepWorkspace) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ocrsieve-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self {
            dir: Some(dir),
            keep,
            errors: 0,
        })
    }

    pub fn path(&self) -> &Path {
        // `dir` is only None after finish()/discard() consumed self
        self.dir.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }

    /// Absolute path for a scratch file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Count a pipeline error against this message, for graded retention.
    pub fn note_error(&mut self) {
        self.errors += 1;
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Apply the retention policy. Returns the kept path, if any.
    pub fn finish(mut self) -> Option<PathBuf> {
        let keep = match self.keep {
            KeepWorkspace::Always => true,
            KeepWorkspace::OnError => self.errors > 0,
            KeepWorkspace::Never => false,
        };
        let dir = self.dir.take()?;
        if keep {
            let path = dir.keep();
            tracing::info!(path = %path.display(), errors = self.errors, "keeping workspace");
            Some(path)
        } else {
            if let Err(e) = dir.close() {
                tracing::warn!("failed to remove workspace: {e}");
            }
            None
        }
    }

    /// Unconditional removal, retention policy ignored. Used when the
    /// global timeout abandons the message.
    pub fn discard(mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!("failed to discard workspace: {e}");
            }
        }
    }
}
