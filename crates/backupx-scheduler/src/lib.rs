//! # backupx scheduler
//!
//! Recurring per-project backups: timers, the execution pipeline,
//! filename-date retention and the delivery sinks.
//!
//! ## Design
//! - One tokio task per enabled project, one retention task per generation
//! - Per-project async mutex: a project never runs twice at once
//! - Generations are replaced wholesale on reload, never edited
//! - Notification and upload are detached, bounded and never alter a result
//!
//! ## Architecture
//! ```text
//! Supervisor (reload = stop old generation, start new)
//!   └── SchedulerHandle (CancellationToken + TaskTracker)
//!         ├── project "mysql": sleep(first delay) → run → sleep(period) → …
//!         ├── project "files": …
//!         └── retention: daily 02:00 → local dirs + remote prefixes
//!
//! ExecutionPipeline
//!   render #{…} → shell-<date>-backup.sh → bash → validate_artifact
//!     └── detached: WebhookNotifier, S3Store upload
//! ```

pub mod anchor;
pub mod dispatch;
pub mod engine;
pub mod pipeline;
pub mod retention;
pub mod storage;

pub use dispatch::{NotificationSink, WebhookNotifier};
pub use engine::{BackupRunner, ExecutionLocks, RunOutcome, ScheduleState, SchedulerHandle, Supervisor};
pub use pipeline::{ExecutionPipeline, Placeholder, validate_artifact};
pub use retention::{RetentionSweep, SweepReport};
pub use storage::{ObjectStore, S3Store};
