//! Per-request scratch directories.
//!
//! Each request gets a freshly created, uniquely named directory with a fixed
//! layout:
//!
//! ```text
//! <parent>/doxygen-XXXXXX/
//!     input/          extracted upload
//!     html/           generator output
//!     doxygen.conf    materialized configuration
//! ```
//!
//! The directory is owned by a [`tempfile::TempDir`], so it is removed when
//! the [`Workspace`] is dropped even if the request fails, panics, or is
//! cancelled. [`Workspace::destroy`] removes it eagerly and reports failures.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "html";
pub const CONFIG_FILE: &str = "doxygen.conf";

/// Allocates workspaces under a parent directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    parent: PathBuf,
    prefix: String,
}

impl WorkspaceManager {
    /// `parent` defaults to the system temporary directory.
    pub fn new(parent: Option<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            parent: parent.unwrap_or_else(std::env::temp_dir),
            prefix: prefix.into(),
        }
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn create(&self) -> Result<Workspace, WorkspaceError> {
        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.parent)
            .map_err(|source| WorkspaceError::Create {
                parent: self.parent.clone(),
                source,
            })?;

        let input = dir.path().join(INPUT_DIR);
        let html = dir.path().join(OUTPUT_DIR);
        for sub in [&input, &html] {
            fs::create_dir(sub).map_err(|source| WorkspaceError::Layout {
                path: sub.clone(),
                source,
            })?;
        }
        let config_path = dir.path().join(CONFIG_FILE);

        info!(path = %dir.path().display(), "Created workspace");
        Ok(Workspace {
            dir,
            input,
            html,
            config_path,
        })
    }
}

/// An isolated directory tree that exists for exactly one request.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    input: PathBuf,
    html: PathBuf,
    config_path: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_dir(&self) -> &Path {
        &self.input
    }

    pub fn output_dir(&self) -> &Path {
        &self.html
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory the workspace lives in; it must be visible to the generator.
    pub fn parent(&self) -> &Path {
        self.root().parent().unwrap_or_else(|| self.root())
    }

    /// Remove the whole tree now.
    pub fn destroy(self) -> Result<(), WorkspaceError> {
        let path = self.root().to_path_buf();
        match self.dir.close() {
            Ok(()) => {
                debug!(path = %path.display(), "Removed workspace");
                Ok(())
            }
            Err(source) => {
                warn!(path = %path.display(), error = ?source, "Failed to remove workspace");
                Err(WorkspaceError::Cleanup { path, source })
            }
        }
    }
}
