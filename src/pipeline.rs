//! Request pipeline: one uploaded tarball in, one tarball of HTML out.
//!
//! Stages run strictly in order and never loop back:
//!
//! ```text
//! Validate -> AllocateWorkspace -> MaterializeConfig -> ExtractInput
//!          -> Invoke -> PackOutput -> CompressOutput -> Respond
//! ```
//!
//! The first failing stage ends the request. Whatever happens, the workspace
//! is removed before [`Pipeline::run`] returns, or, if the request future is
//! dropped mid-flight, as soon as the last blocking task holding it finishes.
//!
//! # Error Handling
//! Failures come back as [`PipelineError`]; the caller turns them into a bare
//! status code. Stage and cause are logged here, inside a span carrying the
//! request id.

use axum::body::Bytes;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::contract::Generator;
use crate::error::{PipelineError, Stage};
use crate::materialize::materialize;
use crate::pack;
use crate::unpack;
use crate::workspace::{Workspace, WorkspaceManager};

/// The only media type accepted and produced.
pub const ARCHIVE_MEDIA_TYPE: &str = "application/tar+gzip";

pub struct Pipeline {
    workspaces: WorkspaceManager,
    template: PathBuf,
    generator: Arc<dyn Generator>,
    admission: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(config: &ServiceConfig, generator: Arc<dyn Generator>) -> Self {
        Self {
            workspaces: WorkspaceManager::new(
                config.workspace_parent.clone(),
                config.workspace_prefix.clone(),
            ),
            template: config.template_conf.clone(),
            generator,
            admission: Arc::new(Semaphore::new(config.generator.max_concurrent.max(1))),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Reject anything that is not declared as a gzip'd tarball.
    pub fn validate(content_type: Option<&str>) -> Result<(), PipelineError> {
        match content_type {
            Some(ARCHIVE_MEDIA_TYPE) => Ok(()),
            other => Err(PipelineError::UnsupportedMediaType {
                found: other.map(str::to_owned),
            }),
        }
    }

    /// Run every stage for one request and return the compressed output.
    pub async fn run(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Vec<u8>, PipelineError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("pipeline", %request_id);
        async move {
            info!(bytes = body.len(), "Request arrived");
            let result = self.run_stages(content_type, body).await;
            match &result {
                Ok(output) => info!(bytes = output.len(), "Request completed"),
                Err(e) if e.is_client_error() => {
                    warn!(stage = %e.stage(), error = %e, "Request rejected")
                }
                Err(e) => error!(stage = %e.stage(), error = ?e, "Request failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Vec<u8>, PipelineError> {
        Self::validate(content_type)?;

        let workspace = Arc::new(self.workspaces.create()?);
        let result = self.process(&workspace, body).await;
        release(workspace);
        result
    }

    async fn process(
        &self,
        workspace: &Arc<Workspace>,
        body: Bytes,
    ) -> Result<Vec<u8>, PipelineError> {
        let config_path = materialize(&self.template, workspace).await?;

        let ws = Arc::clone(workspace);
        let summary = blocking(Stage::ExtractInput, move || {
            unpack::extract(Cursor::new(body), ws.input_dir())
        })
        .await??;
        debug!(files = summary.files, directories = summary.directories, "Input ready");

        let permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| PipelineError::AdmissionClosed)?;
        debug!(
            available = self.admission.available_permits(),
            "Admitted to generator"
        );
        self.generator.run(&config_path, workspace).await?;
        drop(permit);

        let ws = Arc::clone(workspace);
        let compressed = blocking(Stage::PackOutput, move || {
            pack::pack_and_compress(ws.output_dir(), ws.root())
        })
        .await??;

        tokio::fs::read(&compressed)
            .await
            .map_err(|source| PipelineError::Output {
                path: compressed,
                source,
            })
    }
}

/// Run a filesystem-heavy stage off the async workers.
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Task {
            stage,
            message: e.to_string(),
        })
}

/// Remove the workspace now if nothing else holds it; otherwise the last
/// holder removes it on drop.
fn release(workspace: Arc<Workspace>) {
    match Arc::try_unwrap(workspace) {
        Ok(workspace) => {
            if let Err(e) = workspace.destroy() {
                error!(error = %e, "Workspace cleanup failed");
            }
        }
        Err(shared) => {
            warn!(path = %shared.root().display(), "Workspace still in use, removal deferred");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockGenerator;
    use crate::error::GeneratorError;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, ServiceConfig) {
        let scratch = tempdir().unwrap();
        let template = scratch.path().join("template.conf");
        std::fs::write(&template, "INPUT = src\nHTML_OUTPUT = html\n").unwrap();
        let workspaces = scratch.path().join("workspaces");
        std::fs::create_dir(&workspaces).unwrap();

        let config = ServiceConfig {
            template_conf: template,
            workspace_parent: Some(workspaces),
            ..ServiceConfig::default()
        };
        (scratch, config)
    }

    fn workspace_count(config: &ServiceConfig) -> usize {
        std::fs::read_dir(config.workspace_parent.as_ref().unwrap())
            .unwrap()
            .count()
    }

    fn upload(files: &[(&str, &[u8])]) -> Bytes {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn validate_accepts_only_the_archive_media_type() {
        assert!(Pipeline::validate(Some("application/tar+gzip")).is_ok());
        for bad in [None, Some("application/gzip"), Some("text/plain"), Some("")] {
            assert!(matches!(
                Pipeline::validate(bad),
                Err(PipelineError::UnsupportedMediaType { .. })
            ));
        }
    }

    #[tokio::test]
    async fn wrong_content_type_allocates_nothing() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator.expect_run().never();
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let err = pipeline
            .run(Some("application/zip"), upload(&[("a.h", &b"int a;"[..])]))
            .await
            .unwrap_err();

        assert_eq!(err.status(), axum::http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(workspace_count(&config), 0);
    }

    #[tokio::test]
    async fn generator_sees_extracted_input_and_output_is_packed() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator
            .expect_run()
            .times(1)
            .returning(|config_path, workspace| {
                let conf = std::fs::read_to_string(config_path).unwrap();
                assert!(conf.contains(&format!("INPUT = {}", workspace.input_dir().display())));
                let source = std::fs::read(workspace.input_dir().join("a.h")).unwrap();
                std::fs::write(workspace.output_dir().join("a.html"), source).unwrap();
                Ok(())
            });
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let output = pipeline
            .run(Some(ARCHIVE_MEDIA_TYPE), upload(&[("a.h", &b"int a;"[..])]))
            .await
            .expect("pipeline");

        let out = tempdir().unwrap();
        unpack::extract(&output[..], out.path()).unwrap();
        assert_eq!(
            std::fs::read(out.path().join("html/a.html")).unwrap(),
            b"int a;"
        );
        assert_eq!(workspace_count(&config), 0);
    }

    #[tokio::test]
    async fn generator_failure_is_500_and_cleans_up() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator.expect_run().times(1).returning(|_, _| {
            Err(GeneratorError::Timeout {
                program: "doxygen".into(),
                after: std::time::Duration::from_secs(1),
            })
        });
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let err = pipeline
            .run(Some(ARCHIVE_MEDIA_TYPE), upload(&[("a.h", &b"int a;"[..])]))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Invoke);
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(workspace_count(&config), 0);
    }

    #[tokio::test]
    async fn corrupt_body_is_400_and_generator_never_runs() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator.expect_run().never();
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let err = pipeline
            .run(Some(ARCHIVE_MEDIA_TYPE), Bytes::from_static(b"nope"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ExtractInput);
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(workspace_count(&config), 0);
    }

    #[tokio::test]
    async fn missing_template_is_500_and_cleans_up() {
        let (scratch, mut config) = setup();
        config.template_conf = scratch.path().join("missing.conf");
        let mut generator = MockGenerator::new();
        generator.expect_run().never();
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let err = pipeline
            .run(Some(ARCHIVE_MEDIA_TYPE), upload(&[("a.h", &b"int a;"[..])]))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::MaterializeConfig);
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(workspace_count(&config), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_only_upload_directories_are_cleaned_up() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator.expect_run().times(1).returning(|_, _| Ok(()));
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o555);
        builder.append_data(&mut dir, "src", std::io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(6);
        file.set_mode(0o444);
        builder.append_data(&mut file, "src/a.h", &b"int a;"[..]).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        let body = Bytes::from(encoder.finish().unwrap());

        pipeline
            .run(Some(ARCHIVE_MEDIA_TYPE), body)
            .await
            .expect("pipeline");
        assert_eq!(workspace_count(&config), 0);
    }

    #[tokio::test]
    async fn conflicting_entries_are_400() {
        let (_scratch, config) = setup();
        let mut generator = MockGenerator::new();
        generator.expect_run().never();
        let pipeline = Pipeline::new(&config, Arc::new(generator));

        let err = pipeline
            .run(
                Some(ARCHIVE_MEDIA_TYPE),
                upload(&[("a", &b"x"[..]), ("a/b", &b"y"[..])]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(workspace_count(&config), 0);
    }

    /// Records how many runs overlap.
    #[derive(Default)]
    struct CountingGenerator {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Generator for CountingGenerator {
        async fn run(
            &self,
            _config_path: &Path,
            _workspace: &Workspace,
        ) -> Result<(), GeneratorError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generator_runs_never_exceed_max_concurrent() {
        let (_scratch, mut config) = setup();
        config.generator.max_concurrent = 2;
        let generator = Arc::new(CountingGenerator::default());
        let pipeline = Arc::new(Pipeline::new(&config, generator.clone()));

        let requests: Vec<_> = (0..6)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline
                        .run(Some(ARCHIVE_MEDIA_TYPE), upload(&[("a.h", &b"int a;"[..])]))
                        .await
                })
            })
            .collect();
        for request in requests {
            request.await.unwrap().expect("pipeline");
        }

        assert_eq!(generator.finished.load(Ordering::SeqCst), 6);
        assert_eq!(generator.peak.load(Ordering::SeqCst), 2);
        assert_eq!(workspace_count(&config), 0);
    }

    /// State letter from `/proc/<pid>/stat`, or `None` once the process is gone.
    #[cfg(target_os = "linux")]
    fn process_state(pid: &str) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        stat.rsplit_once(") ").and_then(|(_, rest)| rest.chars().next())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_request_kills_generator_and_removes_workspace() {
        use crate::generator::CommandGenerator;

        let (scratch, config) = setup();
        let pid_file = scratch.path().join("generator.pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".into(), script, "generator".into()],
            Duration::from_secs(60),
        );
        let pipeline = Arc::new(Pipeline::new(&config, Arc::new(generator)));

        let request = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .run(Some(ARCHIVE_MEDIA_TYPE), upload(&[("a.h", &b"int a;"[..])]))
                    .await
            })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut pid = String::new();
        while pid.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pid = std::fs::read_to_string(&pid_file)
                .unwrap_or_default()
                .trim()
                .to_string();
        }
        assert!(!pid.is_empty(), "generator never started");
        assert_eq!(workspace_count(&config), 1);

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert_eq!(workspace_count(&config), 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while matches!(process_state(&pid), Some(state) if state != 'Z')
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(
            matches!(process_state(&pid), None | Some('Z')),
            "generator {pid} still running"
        );
    }
}
