//! External generator invocation.
//!
//! The generator is launched as `<program> <args...> <config path>`. Arguments
//! may contain two placeholders:
//!
//! - `{workspace_parent}`: the directory workspaces are created in; the
//!   default docker invocation bind-mounts it at the same path
//! - `{container_name}`: a name unique to the request (the workspace's
//!   directory name), given to the container with `--name`
//!
//! The child is killed if it outlives the configured timeout or if the request
//! future is dropped (client went away). Killing the docker CLI does not stop
//! the container it started, so when the arguments name the run, the stop
//! command (`<program> <stop_args...>`, by default `docker kill <name>`) is
//! issued as well: awaited on timeout, fired off when the future is dropped.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::GeneratorConfig;
use crate::contract::Generator;
use crate::error::GeneratorError;
use crate::workspace::Workspace;

pub const WORKSPACE_PARENT_TOKEN: &str = "{workspace_parent}";
pub const CONTAINER_NAME_TOKEN: &str = "{container_name}";

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the generator as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    stop_args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            stop_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments for `program` that stop a named run left behind on timeout.
    pub fn with_stop_args(mut self, stop_args: Vec<String>) -> Self {
        self.stop_args = stop_args;
        self
    }

    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
        .with_stop_args(config.stop_args.clone())
    }

    /// Name the run is known by outside this process.
    pub fn container_name(workspace: &Workspace) -> String {
        workspace
            .root()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "doxygen".to_string())
    }

    fn expand(&self, arg: &str, workspace: &Workspace) -> String {
        arg.replace(WORKSPACE_PARENT_TOKEN, &workspace.parent().to_string_lossy())
            .replace(CONTAINER_NAME_TOKEN, &Self::container_name(workspace))
    }

    /// Arguments with placeholders expanded and the config path appended.
    pub fn arguments(&self, config_path: &Path, workspace: &Workspace) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| self.expand(arg, workspace))
            .chain(std::iter::once(config_path.to_string_lossy().into_owned()))
            .collect()
    }

    /// Expanded stop arguments, or `None` when the run is not named and
    /// killing the child is all there is to do.
    pub fn stop_arguments(&self, workspace: &Workspace) -> Option<Vec<String>> {
        let named = self.args.iter().any(|arg| arg.contains(CONTAINER_NAME_TOKEN));
        if !named || self.stop_args.is_empty() {
            return None;
        }
        Some(
            self.stop_args
                .iter()
                .map(|arg| self.expand(arg, workspace))
                .collect(),
        )
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn run(&self, config_path: &Path, workspace: &Workspace) -> Result<(), GeneratorError> {
        let args = self.arguments(config_path, workspace);
        info!(program = %self.program, ?args, timeout = ?self.timeout, "Launching generator");

        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!(program = %self.program, error = ?source, "Failed to launch generator");
                GeneratorError::Launch {
                    program: self.program.clone(),
                    source,
                }
            })?;
        let stop = self
            .stop_arguments(workspace)
            .map(|args| StopOnDrop::new(&self.program, args));

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                error!(program = %self.program, error = ?source, "Failed waiting for generator");
                if let Some(stop) = stop {
                    stop.stop().await;
                }
                return Err(GeneratorError::Wait {
                    program: self.program.clone(),
                    source,
                });
            }
            Err(_) => {
                error!(program = %self.program, timeout = ?self.timeout, "Generator timed out, killed");
                if let Some(stop) = stop {
                    stop.stop().await;
                }
                return Err(GeneratorError::Timeout {
                    program: self.program.clone(),
                    after: self.timeout,
                });
            }
        };
        if let Some(stop) = stop {
            stop.disarm();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            debug!(program = %self.program, %stdout, %stderr, "Generator output");
            info!(program = %self.program, status = ?output.status, "Generator finished");
            Ok(())
        } else {
            warn!(program = %self.program, %stdout, %stderr, "Generator output");
            error!(program = %self.program, status = %output.status, "Generator exited with non-zero code");
            Err(GeneratorError::Exit {
                program: self.program.clone(),
                status: output.status,
            })
        }
    }
}

/// Issues the stop command for a named run unless disarmed. Dropped while
/// armed, it starts the command without waiting for it.
struct StopOnDrop {
    program: String,
    args: Vec<String>,
    armed: bool,
}

impl StopOnDrop {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            armed: true,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    /// Run the stop command to completion. Stays armed until it has, so a
    /// cancelled stop still fires from `drop`.
    async fn stop(mut self) {
        info!(program = %self.program, args = ?self.args, "Stopping generator run");
        match tokio::time::timeout(STOP_TIMEOUT, self.command().status()).await {
            Ok(Ok(status)) if status.success() => debug!(%status, "Generator run stopped"),
            Ok(Ok(status)) => warn!(%status, args = ?self.args, "Stop command failed"),
            Ok(Err(e)) => warn!(error = ?e, args = ?self.args, "Failed to launch stop command"),
            Err(_) => warn!(args = ?self.args, "Stop command timed out"),
        }
        self.armed = false;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(args = ?self.args, "No runtime to stop abandoned generator run");
            return;
        }
        match self.command().spawn() {
            Ok(_) => {
                info!(program = %self.program, args = ?self.args, "Stopping abandoned generator run")
            }
            Err(e) => warn!(error = ?e, args = ?self.args, "Failed to launch stop command"),
        }
    }
}
