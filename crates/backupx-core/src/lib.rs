//! # backupx core
//!
//! Configuration model, run outcome types and the error taxonomy shared by
//! the security and scheduler crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, ConfigStore, FileConfigStore, ProjectSpec, S3Config, WebhookConfig};
pub use error::{BackupError, Result};
pub use types::{Artifact, BackupKind, ExecutionResult, RUN_DATE_FORMAT, SCRIPT_PREFIX};
