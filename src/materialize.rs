//! Per-request doxygen configuration.
//!
//! The template is treated as opaque bytes except for two assignment lines,
//! `INPUT = ...` and `HTML_OUTPUT = ...`, which are replaced wholesale so the
//! generator reads from the workspace's `input/` and writes to its `html/`.

use regex::bytes::{NoExpand, Regex};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, info};

use crate::error::ConfigError;
use crate::workspace::Workspace;

pub const INPUT_FIELD: &str = "INPUT";
pub const HTML_OUTPUT_FIELD: &str = "HTML_OUTPUT";

// `[ \t]*` rather than `\s*`: `\s` also matches newlines and would swallow
// blank lines above the assignment.
static INPUT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*INPUT[ \t]*=.*$").expect("INPUT pattern compiles"));
static HTML_OUTPUT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*HTML_OUTPUT[ \t]*=.*$").expect("HTML_OUTPUT pattern compiles")
});

/// Copy `template` into the workspace and point it at the workspace's
/// `input/` and `html/` directories. Returns the written config path.
pub async fn materialize(template: &Path, workspace: &Workspace) -> Result<PathBuf, ConfigError> {
    let config_path = workspace.config_path().to_path_buf();
    debug!(template = %template.display(), "Reading configuration template");

    let content = tokio::fs::read(template).await.map_err(|source| {
        error!(template = %template.display(), error = ?source, "Failed to read configuration template");
        ConfigError::Read {
            path: template.to_path_buf(),
            source,
        }
    })?;

    write(&config_path, &content).await?;
    let rendered = render(template, &content, workspace.input_dir(), workspace.output_dir())?;
    write(&config_path, &rendered).await?;

    info!(config = %config_path.display(), "Materialized generator configuration");
    Ok(config_path)
}

/// Rewrite the two directory assignments in `content`.
///
/// `template` only names the source in errors.
pub fn render(
    template: &Path,
    content: &[u8],
    input: &Path,
    html_output: &Path,
) -> Result<Vec<u8>, ConfigError> {
    for (pattern, field) in [
        (&*INPUT_LINE, INPUT_FIELD),
        (&*HTML_OUTPUT_LINE, HTML_OUTPUT_FIELD),
    ] {
        if !pattern.is_match(content) {
            error!(template = %template.display(), field, "Configuration template lacks a required field");
            return Err(ConfigError::MissingField {
                path: template.to_path_buf(),
                field,
            });
        }
    }

    let input_line = format!("{INPUT_FIELD} = {}", input.to_string_lossy());
    let output_line = format!("{HTML_OUTPUT_FIELD} = {}", html_output.to_string_lossy());
    let rendered = INPUT_LINE.replace_all(content, NoExpand(input_line.as_bytes()));
    let rendered = HTML_OUTPUT_LINE.replace_all(&rendered, NoExpand(output_line.as_bytes()));
    Ok(rendered.into_owned())
}

async fn write(path: &Path, content: &[u8]) -> Result<(), ConfigError> {
    tokio::fs::write(path, content).await.map_err(|source| {
        error!(config = %path.display(), error = ?source, "Failed to write configuration");
        ConfigError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}
