//! backupx configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::types::BackupKind;

/// Directory (under the backup root) holding one sub-directory per project.
pub const PROJECTS_DIR: &str = "backupx-files";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Installation-wide key material (88 chars). Empty until first save.
    #[serde(default)]
    pub encrypt_key: String,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectSpec>,
}

impl Config {
    /// Get the default config path (~/.backupx/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the backupx home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".backupx")
    }

    /// Directory holding all project directories for a backup root.
    pub fn projects_dir(root: &Path) -> PathBuf {
        root.join(PROJECTS_DIR)
    }

    pub fn project(&self, name: &str) -> Option<&ProjectSpec> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// One configured backup task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    /// Shell procedure template. See the pipeline's placeholder set.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub kind: BackupKind,
    /// Days to keep local artifacts. 0 keeps them forever.
    #[serde(default = "default_save_days")]
    pub save_days: u32,
    /// Days to keep uploaded artifacts. 0 keeps them forever.
    #[serde(default = "default_save_days")]
    pub save_days_remote: u32,
    /// Hour of day (0-23) of the first run.
    #[serde(default)]
    pub start_hour: u32,
    #[serde(default = "default_period_minutes")]
    pub period_minutes: u64,
    /// Encrypted database password, substituted for `#{PWD}`.
    #[serde(default)]
    pub password: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_save_days() -> u32 { 30 }
fn default_period_minutes() -> u64 { 1440 }
fn bool_true() -> bool { true }

impl ProjectSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            kind: BackupKind::default(),
            save_days: default_save_days(),
            save_days_remote: default_save_days(),
            start_hour: 0,
            period_minutes: default_period_minutes(),
            password: String::new(),
            enabled: true,
        }
    }

    /// Name and procedure are both present.
    pub fn is_defined(&self) -> bool {
        !self.name.trim().is_empty() && !self.command.trim().is_empty()
    }

    /// Start hour and period describe a usable schedule.
    pub fn has_valid_schedule(&self) -> bool {
        self.start_hour < 24 && self.period_minutes > 0
    }

    /// Enabled and well formed. Only such a project is given a timer or
    /// executed on request.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.is_defined() && self.has_valid_schedule()
    }

    /// Storage directory of this project under the projects directory.
    pub fn project_path(&self, projects_dir: &Path) -> PathBuf {
        projects_dir.join(&self.name)
    }
}

/// S3-compatible object storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    /// Encrypted secret key, substituted for `#{SecretKey}`.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
}

impl S3Config {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.is_empty()
            && !self.bucket_name.is_empty()
    }
}

/// Outcome webhook settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    /// Request body template. Empty sends a GET instead of a POST.
    #[serde(default)]
    pub request_body: String,
}

/// Where configuration is loaded from and saved to.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// TOML file backed config store.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Config> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            BackupError::Config(format!(
                "Failed to read config {}: {e}",
                self.path.display()
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!(
            "Loaded {} projects from {}",
            config.projects.len(),
            self.path.display()
        );
        Ok(config)
    }

    fn save(&self, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config)
            .map_err(|e| BackupError::ConfigSaveFailed(format!("serialize: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackupError::ConfigSaveFailed(e.to_string()))?;
        }
        write_private(&self.path, &content)
            .map_err(|e| BackupError::ConfigSaveFailed(format!("{}: {e}", self.path.display())))
    }
}

/// Write a file readable by the owner only on Unix (0600).
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(content.as_bytes())
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, content)
    }
}
