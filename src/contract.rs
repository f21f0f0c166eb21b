//! # contract: seam between the pipeline and the documentation generator
//!
//! The pipeline only knows that something turns a materialized configuration
//! plus a workspace into HTML under `html/`. The production implementation is
//! [`CommandGenerator`](crate::generator::CommandGenerator), which runs an
//! external process; tests plug in `MockGenerator` or a shell stub.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`, so consumers can build
//!   deterministic mocks (`MockGenerator`) for unit and integration tests.

use async_trait::async_trait;
use std::path::Path;

#[allow(unused_imports)]
use mockall::{automock, predicate::*};

use crate::error::GeneratorError;
use crate::workspace::Workspace;

/// Runs the documentation generator for one request.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate HTML for `workspace` using the configuration at `config_path`.
    ///
    /// Implementations read from `workspace.input_dir()`, write to
    /// `workspace.output_dir()`, and return only once the work has finished.
    async fn run(&self, config_path: &Path, workspace: &Workspace) -> Result<(), GeneratorError>;
}
