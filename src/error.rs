//! Error taxonomy for the request pipeline.
//!
//! Every stage has its own error type; [`PipelineError`] wraps them at the
//! pipeline boundary and decides which HTTP status the client sees. Nothing
//! from the underlying cause is ever written into a response body.

use axum::http::StatusCode;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Failure while unpacking an uploaded archive.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The gzip layer could not be decoded.
    #[error("corrupt gzip stream: {0}")]
    Decompression(#[source] std::io::Error),

    /// The tar layer is malformed or an entry is truncated.
    #[error("malformed tar archive: {0}")]
    ArchiveFormat(String),

    /// An entry would land outside the extraction root.
    #[error("archive entry escapes extraction root: {}", entry.display())]
    PathTraversal { entry: PathBuf },

    /// Writing the extracted tree failed.
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while building the output tar.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to inspect {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while gzipping the output tar.
#[derive(Debug, Error)]
#[error("failed to compress {}: {source}", path.display())]
pub struct CompressError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Either half of [`pack_and_compress`](crate::pack::pack_and_compress).
#[derive(Debug, Error)]
pub enum OutputArchiveError {
    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Compress(#[from] CompressError),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {}: {source}", parent.display())]
    Create {
        parent: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {}: {source}", path.display())]
    Layout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove workspace {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template has no assignment line for a field that must be rewritten.
    #[error("template {} has no `{field}` assignment", path.display())]
    MissingField { path: PathBuf, field: &'static str },
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited unsuccessfully: {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("`{program}` did not finish within {after:?} and was killed")]
    Timeout { program: String, after: Duration },

    #[error("failed waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pipeline states, in the order a request moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    AllocateWorkspace,
    MaterializeConfig,
    ExtractInput,
    Invoke,
    PackOutput,
    CompressOutput,
    Respond,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::AllocateWorkspace => "allocate_workspace",
            Stage::MaterializeConfig => "materialize_config",
            Stage::ExtractInput => "extract_input",
            Stage::Invoke => "invoke",
            Stage::PackOutput => "pack_output",
            Stage::CompressOutput => "compress_output",
            Stage::Respond => "respond",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any failure of a single request, tagged with where it happened.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported content type {found:?}")]
    UnsupportedMediaType { found: Option<String> },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Compress(#[from] CompressError),

    /// The generator admission semaphore was closed.
    #[error("generator admission closed")]
    AdmissionClosed,

    /// A blocking stage panicked or was cancelled.
    #[error("{stage} task failed: {message}")]
    Task { stage: Stage, message: String },

    #[error("failed to read compressed output {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<OutputArchiveError> for PipelineError {
    fn from(e: OutputArchiveError) -> Self {
        match e {
            OutputArchiveError::Pack(e) => PipelineError::Pack(e),
            OutputArchiveError::Compress(e) => PipelineError::Compress(e),
        }
    }
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::UnsupportedMediaType { .. } => Stage::Validate,
            PipelineError::Workspace(_) => Stage::AllocateWorkspace,
            PipelineError::Config(_) => Stage::MaterializeConfig,
            PipelineError::Extract(_) => Stage::ExtractInput,
            PipelineError::Generator(_) | PipelineError::AdmissionClosed => Stage::Invoke,
            PipelineError::Pack(_) => Stage::PackOutput,
            PipelineError::Compress(_) => Stage::CompressOutput,
            PipelineError::Task { stage, .. } => *stage,
            PipelineError::Output { .. } => Stage::Respond,
        }
    }

    /// Status code the client receives for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PipelineError::Extract(ExtractError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Extract(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the client sent something unusable.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}
