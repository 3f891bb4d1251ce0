//! Retention sweep — deletes expired artifacts by the date in their name.
//!
//! Only names carrying a `YYYY-MM-DD-HH-mm` token are ever considered.
//! If every file of a project would be removed the sweep removes nothing:
//! a bad retention window must never wipe a project's whole history.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use backupx_core::config::{Config, ProjectSpec};
use backupx_core::error::{BackupError, Result};
use backupx_core::types::RUN_DATE_FORMAT;
use chrono::{Local, NaiveDateTime, TimeDelta};
use regex::Regex;

use crate::storage::{ObjectStore, S3Store};

static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9]{4}-[0-9]{2}-[0-9]{2}-[0-9]{2}-[0-9]{2}").expect("date token pattern")
});

/// The run-date embedded in a file name, if any.
pub fn embedded_date(name: &str) -> Option<NaiveDateTime> {
    let token = DATE_TOKEN.find(name)?;
    NaiveDateTime::parse_from_str(token.as_str(), RUN_DATE_FORMAT).ok()
}

/// Names whose embedded date is strictly older than `now - days`.
pub fn expired_candidates(names: &[String], days: u32, now: NaiveDateTime) -> Vec<String> {
    let cutoff = now - TimeDelta::days(i64::from(days));
    names
        .iter()
        .filter(|name| embedded_date(name).is_some_and(|date| date < cutoff))
        .cloned()
        .collect()
}

/// Apply the no-full-wipe guard to the candidates among `names`.
/// `names` must list every file of the project.
pub fn select_for_deletion(
    project: &str,
    names: &[String],
    days: u32,
    now: NaiveDateTime,
) -> Vec<String> {
    let expired = expired_candidates(names, days, now);
    if !expired.is_empty() && expired.len() >= names.len() {
        tracing::warn!(
            "⚠️ Project {} expired files include all files, no deletion will be performed!",
            project
        );
        return Vec::new();
    }
    expired
}

/// What one sweep pass did for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub failed: usize,
}

/// Sweep a project's local directory.
pub fn sweep_dir(project: &str, dir: &Path, days: u32, now: NaiveDateTime) -> Result<SweepReport> {
    let entries = std::fs::read_dir(dir).map_err(|source| BackupError::DirectoryReadFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_file()) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let mut report = SweepReport::default();
    for name in select_for_deletion(project, &names, days, now) {
        match std::fs::remove_file(dir.join(&name)) {
            Ok(()) => {
                tracing::info!("🗑️ Project {}: deleted expired file {}", project, name);
                report.deleted.push(name);
            }
            Err(e) => {
                tracing::warn!("⚠️ Project {}: failed to delete {}: {}", project, name, e);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Sweep a project's objects under `<project>/` in remote storage.
pub async fn sweep_remote(
    project: &str,
    store: &dyn ObjectStore,
    days: u32,
    now: NaiveDateTime,
) -> Result<SweepReport> {
    let prefix = format!("{project}/");
    let keys = store.list(&prefix).await?;
    let names: Vec<String> = keys
        .iter()
        .map(|k| k.strip_prefix(&prefix).unwrap_or(k).to_string())
        .collect();

    let mut report = SweepReport::default();
    for name in select_for_deletion(project, &names, days, now) {
        let key = format!("{prefix}{name}");
        match store.delete(&key).await {
            Ok(()) => {
                tracing::info!("🗑️ Project {}: deleted expired object {}", project, key);
                report.deleted.push(name);
            }
            Err(e) => {
                tracing::warn!("⚠️ Project {}: failed to delete object {}: {}", project, key, e);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Sweeps every project of a configuration, locally and remotely.
pub struct RetentionSweep {
    projects_dir: PathBuf,
}

impl RetentionSweep {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    /// One pass over all defined projects. Failures are logged per project.
    pub async fn sweep_all(&self, config: &Config) {
        let remote: Option<Arc<dyn ObjectStore>> = match S3Store::from_config(config) {
            Ok(Some(store)) => Some(Arc::new(store)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ Remote retention skipped: {}", e);
                None
            }
        };

        for project in config.projects.iter().filter(|p| p.is_defined()) {
            self.sweep_project(project, remote.as_deref()).await;
        }
    }

    async fn sweep_project(&self, project: &ProjectSpec, remote: Option<&dyn ObjectStore>) {
        let now = Local::now().naive_local();

        if project.save_days > 0 {
            let dir = project.project_path(&self.projects_dir);
            let name = project.name.clone();
            let days = project.save_days;
            let outcome =
                tokio::task::spawn_blocking(move || sweep_dir(&name, &dir, days, now)).await;
            match outcome {
                Ok(Ok(report)) => tracing::debug!(
                    "Project {}: {} local files deleted, {} failed",
                    project.name,
                    report.deleted.len(),
                    report.failed
                ),
                Ok(Err(e)) => tracing::warn!("⚠️ Project {}: {}", project.name, e),
                Err(e) => tracing::warn!("⚠️ Project {}: sweep task failed: {}", project.name, e),
            }
        }

        let Some(store) = remote else { return };
        if project.save_days_remote > 0 {
            match sweep_remote(&project.name, store, project.save_days_remote, now).await {
                Ok(report) => tracing::debug!(
                    "Project {}: {} remote objects deleted, {} failed",
                    project.name,
                    report.deleted.len(),
                    report.failed
                ),
                Err(e) => tracing::warn!("⚠️ Project {}: remote sweep failed: {}", project.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backupx_core::types::run_date_token;
    use std::sync::Mutex;

    fn aged(now: NaiveDateTime, days: i64, ext: &str) -> String {
        let at = (now - TimeDelta::days(days)).and_utc();
        format!("app-{}{}", run_date_token(&at), ext)
    }

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2026-03-20-12-00", RUN_DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_embedded_date() {
        let date = embedded_date("a2020-10-10-11-12b.sql").unwrap();
        assert_eq!(date.format(RUN_DATE_FORMAT).to_string(), "2020-10-10-11-12");
        assert!(embedded_date("readme.txt").is_none());
        assert!(embedded_date("2020-13-45-99-99.sql").is_none());
    }

    #[test]
    fn test_candidates_by_age() {
        let now = now();
        let names = vec![aged(now, 5, ".sql"), aged(now, 15, ".sql"), aged(now, 25, ".sql")];
        let expired = expired_candidates(&names, 10, now);
        assert_eq!(expired, vec![names[1].clone(), names[2].clone()]);
    }

    #[test]
    fn test_exact_cutoff_is_kept() {
        let now = now();
        let names = vec![aged(now, 10, ".sql"), "notes.txt".to_string()];
        assert!(expired_candidates(&names, 10, now).is_empty());
    }

    #[test]
    fn test_guard_when_everything_expired() {
        let now = now();
        let names = vec![aged(now, 15, ".sql"), aged(now, 25, ".sql")];
        assert!(select_for_deletion("app", &names, 10, now).is_empty());
    }

    #[test]
    fn test_undated_files_count_toward_total() {
        let now = now();
        let names = vec![
            "a2020-10-10-11-12b.sql".to_string(),
            "test2021-10-10-11-12test.sql".to_string(),
            aged(now, 11, ".sql"),
            "restore-notes.md".to_string(),
        ];
        let selected = select_for_deletion("test", &names, 10, now);
        assert_eq!(selected.len(), 3);
        assert!(!selected.contains(&"restore-notes.md".to_string()));
    }

    #[test]
    fn test_sweep_dir_deletes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let now = now();
        let fresh = aged(now, 5, ".sql");
        let old = aged(now, 15, ".sql");
        let older = aged(now, 25, ".sql");
        for name in [&fresh, &old, &older] {
            std::fs::write(dir.path().join(name), b"dump").unwrap();
        }
        // Dated directories are not files and are never touched.
        std::fs::create_dir(dir.path().join(aged(now, 40, ""))).unwrap();

        let report = sweep_dir("app", dir.path(), 10, now).unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failed, 0);
        assert!(dir.path().join(&fresh).exists());
        assert!(!dir.path().join(&old).exists());
        assert!(!dir.path().join(&older).exists());
        assert!(dir.path().join(aged(now, 40, "")).exists());
    }

    #[test]
    fn test_sweep_dir_guard_keeps_all() {
        let dir = tempfile::tempdir().unwrap();
        let now = now();
        for days in [15, 25] {
            std::fs::write(dir.path().join(aged(now, days, ".sql")), b"dump").unwrap();
        }
        let report = sweep_dir("app", dir.path(), 10, now).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_sweep_dir_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = sweep_dir("app", &dir.path().join("missing"), 10, now()).unwrap_err();
        assert!(matches!(err, BackupError::DirectoryReadFailed { .. }));
    }

    /// In-memory object store.
    struct MemoryStore {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn upload(&self, _local_path: &Path) -> Result<String> {
            unreachable!("not used by the sweep")
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let keys = self.keys.lock().unwrap();
            Ok(keys.iter().filter(|k| k.starts_with(prefix)).cloned().collect())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.keys.lock().unwrap().retain(|k| k != key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_remote_scoped_to_project() {
        let now = now();
        let store = MemoryStore {
            keys: Mutex::new(vec![
                format!("app/{}", aged(now, 5, ".sql")),
                format!("app/{}", aged(now, 25, ".sql")),
                format!("other/{}", aged(now, 25, ".sql")),
            ]),
        };
        let report = sweep_remote("app", &store, 10, now).await.unwrap();
        assert_eq!(report.deleted, vec![aged(now, 25, ".sql")]);

        let left = store.keys.lock().unwrap().clone();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|k| k.starts_with("other/")));
    }

    #[tokio::test]
    async fn test_sweep_remote_guard() {
        let now = now();
        let store = MemoryStore {
            keys: Mutex::new(vec![format!("app/{}", aged(now, 25, ".sql"))]),
        };
        let report = sweep_remote("app", &store, 10, now).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(store.keys.lock().unwrap().len(), 1);
    }
}
