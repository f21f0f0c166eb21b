// doxygen-service/src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_TEMPLATE: &str = "template.conf";

/// Everything the service needs, loaded once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: String,
    /// Doxygen configuration template copied into every workspace.
    pub template_conf: PathBuf,
    /// Where workspaces are created; the system temp dir when unset.
    pub workspace_parent: Option<PathBuf>,
    pub workspace_prefix: String,
    /// Largest accepted upload, in bytes.
    pub max_body_bytes: usize,
    pub generator: GeneratorConfig,
    pub content: ContentConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            template_conf: PathBuf::from(DEFAULT_TEMPLATE),
            workspace_parent: None,
            workspace_prefix: "doxygen-".to_string(),
            max_body_bytes: 64 * 1024 * 1024,
            generator: GeneratorConfig::default(),
            content: ContentConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn trace_loaded(&self) {
        info!(
            listen_addr = %self.listen_addr,
            template_conf = %self.template_conf.display(),
            generator = %self.generator.program,
            max_concurrent = self.generator.max_concurrent,
            timeout_secs = self.generator.timeout_secs,
            "Loaded ServiceConfig"
        );
        debug!(?self, "ServiceConfig loaded (full debug)");
    }
}

/// How the documentation generator is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub program: String,
    /// Leading arguments; the config path is appended after them.
    pub args: Vec<String>,
    /// Arguments for `program` that stop a run named with `{container_name}`
    /// in `args`, issued on timeout or when the request is abandoned.
    pub stop_args: Vec<String>,
    pub timeout_secs: u64,
    /// Generator runs allowed at the same time.
    pub max_concurrent: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: vec![
                "run".to_string(),
                "--name".to_string(),
                "{container_name}".to_string(),
                "-v".to_string(),
                "{workspace_parent}:{workspace_parent}".to_string(),
                "--rm".to_string(),
                "johnnyvm90/doxygen".to_string(),
            ],
            stop_args: vec!["kill".to_string(), "{container_name}".to_string()],
            timeout_secs: 300,
            max_concurrent: 4,
        }
    }
}

/// The `/api` content surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory served to `GET` requests.
    pub root: Option<PathBuf>,
    /// Serve `root` over `GET`; otherwise `GET` answers 405.
    pub static_access: bool,
}
