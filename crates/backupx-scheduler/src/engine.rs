//! Scheduler engine — one timer task per project plus a daily retention task.
//!
//! A [`SchedulerHandle`] is one generation: a cancellation token and the
//! tasks it owns. Reconfiguration never edits a generation; the
//! [`Supervisor`] stops it and starts a fresh one. Per-project execution
//! locks outlive generations so a run can never overlap another run of the
//! same project, whether it came from a timer or from a manual request.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backupx_core::config::{Config, ConfigStore, ProjectSpec};
use backupx_core::error::Result;
use backupx_core::types::ExecutionResult;
use chrono::{DateTime, Local, TimeDelta};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::anchor;
use crate::pipeline::ExecutionPipeline;
use crate::retention::RetentionSweep;

/// Hour of day the retention sweep runs.
pub const SWEEP_HOUR: u32 = 2;

/// Runs one backup to completion.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run(&self, project: &ProjectSpec) -> ExecutionResult;

    /// Wait for background work started by earlier runs.
    async fn drain(&self) {}
}

/// Per-project async mutexes, keyed by project name.
#[derive(Clone, Default)]
pub struct ExecutionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_project(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(name.to_string()).or_default().clone()
    }
}

/// Recurring trigger of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_fire: DateTime<Local>,
    pub period: Duration,
}

/// Project name with its manual-run outcome.
pub type RunOutcome = (String, std::result::Result<ExecutionResult, String>);

type ScheduleTable = Arc<Mutex<BTreeMap<String, ScheduleState>>>;

fn period_of(project: &ProjectSpec) -> Duration {
    Duration::from_secs(project.period_minutes.saturating_mul(60))
}

fn set_state(states: &ScheduleTable, name: &str, state: Option<ScheduleState>) {
    let mut table = states.lock().unwrap_or_else(|e| e.into_inner());
    match state {
        Some(state) => {
            table.insert(name.to_string(), state);
        }
        None => {
            table.remove(name);
        }
    }
}

/// One scheduler generation.
#[derive(Clone)]
pub struct SchedulerHandle {
    config: Arc<Config>,
    runner: Arc<dyn BackupRunner>,
    locks: ExecutionLocks,
    token: CancellationToken,
    tasks: TaskTracker,
    states: ScheduleTable,
}

impl SchedulerHandle {
    /// Start timers for every schedulable project, plus the retention loop
    /// when a sweeper is given.
    pub fn start(
        config: Arc<Config>,
        runner: Arc<dyn BackupRunner>,
        locks: ExecutionLocks,
        sweeper: Option<Arc<RetentionSweep>>,
    ) -> Self {
        Self::start_at(config, runner, locks, sweeper, Local::now())
    }

    /// Like [`SchedulerHandle::start`] with first fires anchored at `now`.
    pub fn start_at(
        config: Arc<Config>,
        runner: Arc<dyn BackupRunner>,
        locks: ExecutionLocks,
        sweeper: Option<Arc<RetentionSweep>>,
        now: DateTime<Local>,
    ) -> Self {
        let handle = Self {
            config,
            runner,
            locks,
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            states: Arc::new(Mutex::new(BTreeMap::new())),
        };

        for project in handle.config.projects.iter() {
            if !project.is_runnable() {
                if project.is_defined() {
                    tracing::info!(
                        "⏸️ Project {} is not scheduled (disabled or invalid schedule)",
                        project.name
                    );
                }
                continue;
            }
            let delay = anchor::initial_delay(project.start_hour, &now);
            set_state(
                &handle.states,
                &project.name,
                Some(ScheduleState {
                    next_fire: now + TimeDelta::from_std(delay).unwrap_or_default(),
                    period: period_of(project),
                }),
            );
            tracing::info!(
                "📅 Project {} scheduled: first run in {}s, then every {} min",
                project.name,
                delay.as_secs(),
                project.period_minutes
            );
            handle.tasks.spawn(project_loop(
                project.clone(),
                delay,
                handle.runner.clone(),
                handle.locks.for_project(&project.name),
                handle.token.clone(),
                handle.states.clone(),
            ));
        }

        if let Some(sweeper) = sweeper {
            handle.tasks.spawn(retention_loop(
                handle.config.clone(),
                sweeper,
                anchor::initial_delay(SWEEP_HOUR, &now),
                handle.token.clone(),
            ));
        }
        handle.tasks.close();
        handle
    }

    /// Cancel the generation. Waiting loops exit; an in-flight run finishes.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop and wait for every task and pending delivery of this generation.
    pub async fn shutdown(&self) {
        self.stop();
        self.tasks.wait().await;
        self.runner.drain().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of the live triggers.
    pub fn schedule(&self) -> Vec<(String, ScheduleState)> {
        let table = self.states.lock().unwrap_or_else(|e| e.into_inner());
        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Run one project now, outside its timer. The schedule is unchanged.
    /// A failed run is reported as its error detail.
    pub async fn run_now(&self, name: &str) -> std::result::Result<ExecutionResult, String> {
        let project = self
            .config
            .project(name)
            .filter(|p| p.is_runnable())
            .ok_or_else(|| format!("Project {name} is not defined, disabled or malformed"))?;

        let lock = self.locks.for_project(&project.name);
        let _guard = lock.lock().await;
        let result = self.runner.run(project).await;
        match &result.error {
            Some(error) if !result.success => Err(format!("Project {name}: {error}")),
            _ => Ok(result),
        }
    }

    /// Run every runnable project now, one after another.
    pub async fn run_all(&self) -> Vec<RunOutcome> {
        let mut results = Vec::new();
        for project in self.config.projects.iter().filter(|p| p.is_runnable()) {
            let outcome = self.run_now(&project.name).await;
            results.push((project.name.clone(), outcome));
        }
        results
    }
}

async fn project_loop(
    project: ProjectSpec,
    first_delay: Duration,
    runner: Arc<dyn BackupRunner>,
    lock: Arc<tokio::sync::Mutex<()>>,
    token: CancellationToken,
    states: ScheduleTable,
) {
    let period = period_of(&project);
    let mut wait = first_delay;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let guard = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            guard = lock.lock() => guard,
        };
        let result = runner.run(&project).await;
        drop(guard);
        tracing::debug!("Project {} run finished: {}", project.name, result.result_label());

        wait = period;
        set_state(
            &states,
            &project.name,
            Some(ScheduleState {
                next_fire: Local::now() + TimeDelta::from_std(period).unwrap_or_default(),
                period,
            }),
        );
    }

    set_state(&states, &project.name, None);
    tracing::debug!("Project {} timer stopped", project.name);
}

async fn retention_loop(
    config: Arc<Config>,
    sweeper: Arc<RetentionSweep>,
    first_delay: Duration,
    token: CancellationToken,
) {
    let mut wait = first_delay;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        tracing::info!("🧹 Retention sweep started");
        sweeper.sweep_all(&config).await;
        wait = anchor::initial_delay(SWEEP_HOUR, &Local::now());
    }
}

/// Owns the current generation and replaces it on reload.
pub struct Supervisor {
    store: Arc<dyn ConfigStore>,
    projects_dir: PathBuf,
    locks: ExecutionLocks,
    current: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

impl Supervisor {
    /// Projects live under `<root>/backupx-files/<name>`.
    pub fn new(store: Arc<dyn ConfigStore>, root: &Path) -> Self {
        Self {
            store,
            projects_dir: Config::projects_dir(root),
            locks: ExecutionLocks::new(),
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Load configuration and start the first generation. A load failure
    /// is returned and nothing is started.
    pub async fn start(&self) -> Result<()> {
        let config = self.store.load()?;
        let handle = self.build(config);
        let previous = self.current.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.stop();
        }
        tracing::info!("✅ Scheduler started");
        Ok(())
    }

    /// Reload configuration and restart. If loading fails the running
    /// generation is kept.
    pub async fn reload(&self) -> std::result::Result<(), String> {
        let config = self.store.load().map_err(|e| e.to_string())?;
        let mut current = self.current.lock().await;
        if let Some(old) = current.take() {
            old.stop();
        }
        *current = Some(self.build(config));
        tracing::info!("🔄 Scheduler restarted with reloaded configuration");
        Ok(())
    }

    /// Cancel the current generation without waiting.
    pub async fn stop(&self) {
        if let Some(handle) = self.current.lock().await.take() {
            handle.stop();
        }
    }

    /// Cancel the current generation and wait for in-flight runs.
    pub async fn shutdown(&self) {
        let handle = self.current.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            tracing::info!("🛑 Scheduler stopped");
        }
    }

    pub async fn handle(&self) -> Option<SchedulerHandle> {
        self.current.lock().await.clone()
    }

    pub async fn run_now(&self, name: &str) -> std::result::Result<ExecutionResult, String> {
        let handle = self
            .handle()
            .await
            .ok_or_else(|| "Scheduler is not running".to_string())?;
        handle.run_now(name).await
    }

    pub async fn run_all(&self) -> std::result::Result<Vec<RunOutcome>, String> {
        let handle = self
            .handle()
            .await
            .ok_or_else(|| "Scheduler is not running".to_string())?;
        Ok(handle.run_all().await)
    }

    fn build(&self, config: Config) -> SchedulerHandle {
        let config = Arc::new(config);
        let pipeline: Arc<dyn BackupRunner> =
            Arc::new(ExecutionPipeline::new(&self.projects_dir, config.clone()));
        let sweeper = Arc::new(RetentionSweep::new(&self.projects_dir));
        SchedulerHandle::start(config, pipeline, self.locks.clone(), Some(sweeper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backupx_core::config::FileConfigStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner that counts runs and tracks overlap.
    #[derive(Default)]
    struct Probe {
        work: Duration,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Probe {
        fn with_work(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                ..Default::default()
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackupRunner for Probe {
        async fn run(&self, project: &ProjectSpec) -> ExecutionResult {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            ExecutionResult::succeeded(&project.name, None)
        }
    }

    fn hourly(name: &str) -> ProjectSpec {
        let mut project = ProjectSpec::new(name, "echo");
        project.start_hour = 8;
        project.period_minutes = 60;
        project
    }

    fn config_with(projects: Vec<ProjectSpec>) -> Arc<Config> {
        Arc::new(Config {
            projects,
            ..Config::default()
        })
    }

    /// 07:30, half an hour before the 08:00 start hour.
    fn half_past_seven() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap()
    }

    fn start(config: Arc<Config>, probe: Arc<Probe>) -> SchedulerHandle {
        SchedulerHandle::start_at(config, probe, ExecutionLocks::new(), None, half_past_seven())
    }

    const MIN: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_anchor_then_every_period() {
        let probe = Probe::with_work(Duration::ZERO);
        let handle = start(config_with(vec![hourly("db")]), probe.clone());

        tokio::time::sleep(29 * MIN).await;
        assert_eq!(probe.runs(), 0);

        tokio::time::sleep(2 * MIN).await;
        assert_eq!(probe.runs(), 1);

        tokio::time::sleep(120 * MIN).await;
        assert_eq!(probe.runs(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_runnable_projects_get_timers() {
        let mut disabled = hourly("off");
        disabled.enabled = false;
        let mut bad_hour = hourly("bad");
        bad_hour.start_hour = 24;
        let blank = ProjectSpec::new("blank", "");

        let probe = Probe::with_work(Duration::ZERO);
        let handle = start(
            config_with(vec![hourly("db"), disabled, bad_hour, blank]),
            probe.clone(),
        );
        let schedule = handle.schedule();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].0, "db");
        assert_eq!(schedule[0].1.period, 60 * MIN);
        assert_eq!(schedule[0].1.next_fire, half_past_seven() + TimeDelta::minutes(30));

        tokio::time::sleep(31 * MIN).await;
        assert_eq!(probe.runs(), 1);
        handle.shutdown().await;
        assert!(handle.schedule().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_runs_never_overlap() {
        // Each run outlasts the period and manual runs pile in on top.
        let probe = Probe::with_work(90 * MIN);
        let handle = start(config_with(vec![hourly("db")]), probe.clone());

        let mut manual = Vec::new();
        for _ in 0..3 {
            let handle = handle.clone();
            manual.push(tokio::spawn(async move { handle.run_now("db").await }));
        }

        tokio::time::sleep(10 * 60 * MIN).await;
        for task in manual {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
        assert!(probe.runs() >= 5);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fires_after_stop() {
        let probe = Probe::with_work(Duration::ZERO);
        let handle = start(config_with(vec![hourly("db")]), probe.clone());
        handle.stop();
        assert!(handle.is_stopped());

        tokio::time::sleep(48 * 60 * MIN).await;
        assert_eq!(probe.runs(), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_run_completes_after_stop() {
        let probe = Probe::with_work(10 * MIN);
        let handle = start(config_with(vec![hourly("db")]), probe.clone());

        tokio::time::sleep(31 * MIN).await;
        assert_eq!(probe.active.load(Ordering::SeqCst), 1);

        handle.stop();
        handle.shutdown().await;
        assert_eq!(probe.runs(), 1);
        assert_eq!(probe.active.load(Ordering::SeqCst), 0);

        tokio::time::sleep(24 * 60 * MIN).await;
        assert_eq!(probe.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_rejects_unknown_and_disabled() {
        let mut disabled = hourly("off");
        disabled.enabled = false;
        let probe = Probe::with_work(Duration::ZERO);
        let handle = start(config_with(vec![hourly("db"), disabled]), probe.clone());

        assert!(handle.run_now("nope").await.is_err());
        assert!(handle.run_now("off").await.is_err());
        let result = handle.run_now("db").await.unwrap();
        assert!(result.success);

        let all = handle.run_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(probe.runs(), 2);

        // Manual runs leave the timer where it was.
        assert_eq!(
            handle.schedule()[0].1.next_fire,
            half_past_seven() + TimeDelta::minutes(30)
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_rejects_malformed_projects() {
        let mut bad_hour = hourly("bad");
        bad_hour.start_hour = 24;
        let mut no_period = hourly("zero");
        no_period.period_minutes = 0;
        let probe = Probe::with_work(Duration::ZERO);
        let handle = start(
            config_with(vec![hourly("db"), bad_hour, no_period]),
            probe.clone(),
        );

        let err = handle.run_now("bad").await.unwrap_err();
        assert!(err.contains("malformed"));
        assert!(handle.run_now("zero").await.is_err());
        assert_eq!(probe.runs(), 0);

        let all = handle.run_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "db");
        assert_eq!(probe.runs(), 1);
        handle.shutdown().await;
    }

    fn write_config(store: &FileConfigStore, names: &[&str]) {
        let projects = names
            .iter()
            .map(|n| {
                let mut p = ProjectSpec::new(n, "echo");
                p.kind = backupx_core::types::BackupKind::FileSync;
                p
            })
            .collect();
        store
            .save(&Config {
                projects,
                ..Config::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_supervisor_reload_replaces_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileConfigStore::new(dir.path().join("config.toml")));
        write_config(&store, &["a"]);

        let supervisor = Supervisor::new(store.clone(), dir.path());
        supervisor.start().await.unwrap();
        let first = supervisor.handle().await.unwrap();
        assert_eq!(first.schedule().len(), 1);

        write_config(&store, &["a", "b"]);
        supervisor.reload().await.unwrap();
        assert!(first.is_stopped());
        let second = supervisor.handle().await.unwrap();
        assert!(!second.is_stopped());
        assert_eq!(second.config().projects.len(), 2);

        // A broken file keeps the running generation.
        std::fs::write(store.path(), "project = [[[").unwrap();
        assert!(supervisor.reload().await.is_err());
        let kept = supervisor.handle().await.unwrap();
        assert!(!kept.is_stopped());
        assert_eq!(kept.config().projects.len(), 2);

        supervisor.shutdown().await;
        assert!(supervisor.handle().await.is_none());
        assert!(supervisor.run_now("a").await.is_err());
    }

    #[tokio::test]
    async fn test_supervisor_start_fails_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileConfigStore::new(dir.path().join("missing.toml")));
        let supervisor = Supervisor::new(store, dir.path());
        assert!(supervisor.start().await.is_err());
        assert!(supervisor.handle().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_run_now_executes_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileConfigStore::new(dir.path().join("config.toml")));
        write_config(&store, &["sync"]);

        let supervisor = Supervisor::new(store, dir.path());
        supervisor.start().await.unwrap();
        let result = supervisor.run_now("sync").await.unwrap();
        assert!(result.success);
        assert!(supervisor.projects_dir().join("sync").is_dir());
        supervisor.shutdown().await;
    }
}
