//! Execution pipeline — runs one project's backup procedure end to end.
//!
//! ```text
//! project dir ─► render template ─► shell-<date>-backup.sh ─► bash
//!                                                          │
//!             notify / upload (detached) ◄─ validate ◄─────┘
//! ```
//!
//! The transient script is removed on every exit path by a drop guard.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use backupx_core::config::{Config, ProjectSpec};
use backupx_core::error::{BackupError, Result};
use backupx_core::types::{Artifact, BackupKind, ExecutionResult, SCRIPT_PREFIX, run_date_token};
use backupx_security::{SecretCodec, reveal};
use chrono::Local;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::dispatch::{NotificationSink, WebhookNotifier};
use crate::engine::BackupRunner;
use crate::storage::{ObjectStore, S3Store};

/// Smallest database dump accepted as a real backup, in bytes.
pub const MIN_ARTIFACT_SIZE: u64 = 1000;

/// Upper bound on concurrently running notifications and uploads.
pub const MAX_CONCURRENT_DELIVERIES: usize = 4;

/// Tokens recognised in a project's procedure template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    Date,
    Password,
    AccessKey,
    SecretKey,
    Endpoint,
    BucketName,
}

impl Placeholder {
    pub const ALL: [Placeholder; 6] = [
        Placeholder::Date,
        Placeholder::Password,
        Placeholder::AccessKey,
        Placeholder::SecretKey,
        Placeholder::Endpoint,
        Placeholder::BucketName,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Placeholder::Date => "#{DATE}",
            Placeholder::Password => "#{PWD}",
            Placeholder::AccessKey => "#{AccessKey}",
            Placeholder::SecretKey => "#{SecretKey}",
            Placeholder::Endpoint => "#{Endpoint}",
            Placeholder::BucketName => "#{BucketName}",
        }
    }
}

/// Replace every placeholder present in `values`.
pub fn render(template: &str, values: &BTreeMap<Placeholder, String>) -> String {
    values
        .iter()
        .fold(template.to_string(), |out, (placeholder, value)| {
            out.replace(placeholder.token(), value)
        })
}

/// Placeholder values for one run. Secrets are decrypted here, so a bad
/// ciphertext aborts the run before any script exists.
pub fn substitutions(
    project: &ProjectSpec,
    config: &Config,
    run_date: &str,
) -> Result<BTreeMap<Placeholder, String>> {
    let needs_codec = !project.password.is_empty() || !config.s3.secret_key.is_empty();
    let codec = if needs_codec {
        Some(SecretCodec::from_encoded(&config.encrypt_key)?)
    } else {
        None
    };
    let open = |stored: &str| match &codec {
        Some(codec) => reveal(codec, stored),
        None => Ok(String::new()),
    };

    let mut values = BTreeMap::new();
    values.insert(Placeholder::Date, run_date.to_string());
    values.insert(Placeholder::Password, open(&project.password)?);
    values.insert(Placeholder::AccessKey, config.s3.access_key.clone());
    values.insert(Placeholder::SecretKey, open(&config.s3.secret_key)?);
    values.insert(Placeholder::Endpoint, config.s3.endpoint.clone());
    values.insert(Placeholder::BucketName, config.s3.bucket_name.clone());
    Ok(values)
}

/// Process output as text: UTF-8, else GBK, else lossy UTF-8.
pub fn decode_output(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    let (decoded, _, had_errors) = encoding_rs::GBK.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

pub fn script_name(run_date: &str) -> String {
    if cfg!(windows) {
        format!("{SCRIPT_PREFIX}{run_date}-backup.bat")
    } else {
        format!("{SCRIPT_PREFIX}{run_date}-backup.sh")
    }
}

fn normalize_line_endings(body: &str) -> String {
    if cfg!(windows) {
        body.to_string()
    } else {
        body.replace("\r\n", "\n")
    }
}

/// A script file that exists exactly as long as this guard.
#[derive(Debug)]
struct TransientScript {
    path: PathBuf,
}

impl TransientScript {
    fn create(dir: &Path, run_date: &str, body: &str) -> Result<Self> {
        let path = dir.join(script_name(run_date));
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o700);
        }
        let mut file = options.open(&path)?;
        let script = Self { path };
        file.write_all(normalize_line_endings(body).as_bytes())?;
        Ok(script)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Drop for TransientScript {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("⚠️ Failed to remove script {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Interpreter invocation with stderr folded into stdout, so the captured
/// bytes keep the order the script wrote them in.
fn shell_command(script: &str) -> tokio::process::Command {
    if cfg!(windows) {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/c").arg(script).arg("2>&1");
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c").arg(format!("exec 2>&1; exec bash ./{script}"));
        cmd
    }
}

/// Run `script` inside `dir`. Returns the exit status and the decoded
/// combined output.
async fn run_script(dir: &Path, script: &str) -> Result<(std::process::ExitStatus, String)> {
    let output = shell_command(script)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| BackupError::ExecutionFailed(e.to_string()))?;

    // Anything bash reports before the redirect takes effect.
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok((output.status, decode_output(&combined)))
}

/// First file (by name) in `dir` whose name carries the run-date token.
/// Scripts are never artifacts.
fn find_artifact(run_date: &str, dir: &Path) -> Result<Artifact> {
    let entries = std::fs::read_dir(dir).map_err(|source| BackupError::DirectoryReadFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut found: Vec<Artifact> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(SCRIPT_PREFIX) || !name.contains(run_date) {
                return None;
            }
            let meta = entry.metadata().ok()?;
            meta.is_file().then(|| Artifact {
                name,
                path: entry.path(),
                size: meta.len(),
            })
        })
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));

    found
        .into_iter()
        .next()
        .ok_or_else(|| BackupError::ArtifactNotFound {
            token: run_date.to_string(),
        })
}

/// Decide whether a finished run produced an acceptable artifact.
///
/// A database dump must leave a file named with `run_date` of at least
/// [`MIN_ARTIFACT_SIZE`] bytes. A file sync succeeds on exit status alone;
/// a dated file, if present, is still reported.
pub fn validate_artifact(kind: BackupKind, run_date: &str, dir: &Path) -> Result<Option<Artifact>> {
    match kind {
        BackupKind::DatabaseDump => {
            let artifact = find_artifact(run_date, dir)?;
            if artifact.size < MIN_ARTIFACT_SIZE {
                return Err(BackupError::ArtifactTooSmall {
                    file: artifact.name,
                    size: artifact.size,
                    min: MIN_ARTIFACT_SIZE,
                });
            }
            Ok(Some(artifact))
        }
        BackupKind::FileSync => Ok(find_artifact(run_date, dir).ok()),
    }
}

/// Runs backups for one configuration generation.
pub struct ExecutionPipeline {
    projects_dir: PathBuf,
    config: Arc<Config>,
    notifier: Option<Arc<dyn NotificationSink>>,
    store: Option<Arc<dyn ObjectStore>>,
    permits: Arc<Semaphore>,
    deliveries: TaskTracker,
}

impl ExecutionPipeline {
    /// Pipeline with the webhook and object store described by `config`.
    pub fn new(projects_dir: impl Into<PathBuf>, config: Arc<Config>) -> Self {
        let notifier = WebhookNotifier::from_config(&config.webhook)
            .map(|n| Arc::new(n) as Arc<dyn NotificationSink>);
        let store = match S3Store::from_config(&config) {
            Ok(store) => store.map(|s| Arc::new(s) as Arc<dyn ObjectStore>),
            Err(e) => {
                tracing::warn!("⚠️ Object storage disabled: {}", e);
                None
            }
        };
        Self {
            projects_dir: projects_dir.into(),
            config,
            notifier,
            store,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES)),
            deliveries: TaskTracker::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one project now and hand the result to the delivery sinks.
    pub async fn execute(&self, project: &ProjectSpec) -> ExecutionResult {
        let run_date = run_date_token(&Local::now());
        tracing::info!("🚀 Project {}: backup started ({})", project.name, run_date);

        let (result, artifact) = match self.run_procedure(project, &run_date).await {
            Ok(artifact) => {
                let result = ExecutionResult::succeeded(&project.name, artifact.as_ref());
                match &artifact {
                    Some(a) => tracing::info!(
                        "✅ Project {}: backup succeeded, file {} ({} MB)",
                        project.name,
                        a.name,
                        a.size_mb()
                    ),
                    None => tracing::info!("✅ Project {}: backup succeeded", project.name),
                }
                (result, artifact)
            }
            Err(e) => {
                tracing::error!("❌ Project {}: {}", project.name, e);
                (ExecutionResult::failed(&project.name, &e), None)
            }
        };

        self.deliver(&result, artifact);
        result
    }

    async fn run_procedure(&self, project: &ProjectSpec, run_date: &str) -> Result<Option<Artifact>> {
        let dir = project.project_path(&self.projects_dir);
        tokio::fs::create_dir_all(&dir).await?;

        let values = substitutions(project, &self.config, run_date)?;
        let body = render(&project.command, &values);

        let script = TransientScript::create(&dir, run_date, &body)?;
        let outcome = run_script(&dir, &script.file_name()).await;
        drop(script);
        let (status, text) = outcome?;

        if !text.trim().is_empty() {
            tracing::info!("📜 Project {} output:\n{}", project.name, text.trim_end());
        }

        if !status.success() {
            return Err(BackupError::ExecutionFailed(status.to_string()));
        }
        validate_artifact(project.kind, run_date, &dir)
    }

    /// Spawn notification and upload. Neither can change `result`.
    fn deliver(&self, result: &ExecutionResult, artifact: Option<Artifact>) {
        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let permits = self.permits.clone();
            let result = result.clone();
            self.deliveries.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = notifier.notify(&result).await {
                    tracing::warn!("⚠️ Project {}: {}", result.project, e);
                }
            });
        }

        if !result.success {
            return;
        }
        let (Some(store), Some(artifact)) = (&self.store, artifact) else {
            return;
        };
        let store = store.clone();
        let permits = self.permits.clone();
        let project = result.project.clone();
        self.deliveries.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = store.upload(&artifact.path).await {
                tracing::warn!("⚠️ Project {}: upload of {} failed: {}", project, artifact.name, e);
            }
        });
    }

    /// Wait for every delivery spawned so far.
    pub async fn flush(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }
}

#[async_trait]
impl BackupRunner for ExecutionPipeline {
    async fn run(&self, project: &ProjectSpec) -> ExecutionResult {
        self.execute(project).await
    }

    async fn drain(&self) {
        self.flush().await;
    }
}
