//! Shared value types: backup kinds, run outcomes and the run-date token.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::BackupError;

/// chrono format of the run-date token embedded in artifact and script names.
/// Renders as `YYYY-MM-DD-HH-mm`.
pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Prefix of the transient script written for every run.
pub const SCRIPT_PREFIX: &str = "shell-";

/// Format the run-date token for a moment in time.
pub fn run_date_token<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format(RUN_DATE_FORMAT).to_string()
}

/// How success of a project's procedure is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    /// The procedure must leave a fresh, date-stamped, non-trivial file behind.
    #[default]
    DatabaseDump,
    /// The procedure's exit status alone decides.
    FileSync,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::DatabaseDump => write!(f, "database-dump"),
            BackupKind::FileSync => write!(f, "file-sync"),
        }
    }
}

/// A file produced by a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl Artifact {
    /// Size in whole megabytes (decimal, truncated).
    pub fn size_mb(&self) -> u64 {
        self.size / 1000 / 1000
    }
}

/// Outcome of one backup run. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub project: String,
    pub file_name: Option<String>,
    pub file_size_mb: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(project: &str, artifact: Option<&Artifact>) -> Self {
        Self {
            project: project.to_string(),
            file_name: artifact.map(|a| a.name.clone()),
            file_size_mb: artifact.map(Artifact::size_mb),
            success: true,
            error: None,
        }
    }

    pub fn failed(project: &str, error: &BackupError) -> Self {
        Self {
            project: project.to_string(),
            file_name: None,
            file_size_mb: None,
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// "Success" or "Failed", as shown to operators.
    pub fn result_label(&self) -> &'static str {
        if self.success { "Success" } else { "Failed" }
    }

    /// "N MB", or empty when no artifact was produced.
    pub fn size_label(&self) -> String {
        self.file_size_mb
            .map(|mb| format!("{mb} MB"))
            .unwrap_or_default()
    }
}
