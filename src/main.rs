//! # backupx — recurring shell backups
//!
//! Usage:
//!   backupx                          # Run the scheduler (same as `serve`)
//!   backupx serve --delay-secs 30    # Wait for the network, then schedule
//!   backupx run mysql                # Back up one project now
//!   backupx sweep                    # One retention pass
//!   backupx init                     # Starter config with fresh key material
//!   backupx seal                     # Encrypt plaintext secrets in the config

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use backupx_core::{BackupKind, Config, ConfigStore, FileConfigStore, ProjectSpec};
use backupx_scheduler::{ExecutionPipeline, RetentionSweep, S3Store, Supervisor, WebhookNotifier};
use backupx_security::{encrypt, seal_config};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "backupx",
    version,
    about = "🗄️ backupx — scheduled shell backups with validation, upload and retention"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default: ~/.backupx/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Backup root; projects live in <dir>/backupx-files/<name>
    #[arg(short, long, global = true, default_value = ".")]
    dir: String,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C. SIGHUP reloads the config.
    Serve {
        /// Seconds to wait before the first schedule is built
        #[arg(long, default_value = "0")]
        delay_secs: u64,
    },
    /// Back up one project (or every enabled project) now.
    ///
    /// Runs in this process, independent of a running `serve`. Avoid
    /// starting a project here while its scheduled run is in progress.
    Run { name: Option<String> },
    /// Delete expired artifacts now
    Sweep,
    /// Write a starter config with fresh key material
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Encrypt plaintext secrets in the config and save it
    Seal,
    /// Print the ciphertext of a value under the configured key material
    Encrypt { value: String },
    /// Send a simulated successful result to the webhook
    WebhookTest,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "backupx={level},backupx_core={level},backupx_security={level},backupx_scheduler={level}"
        ))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::default_path);
    let root = expand_path(&cli.dir);
    let store = Arc::new(FileConfigStore::new(config_path));

    match cli.command.unwrap_or(Command::Serve { delay_secs: 0 }) {
        Command::Serve { delay_secs } => serve(store, &root, delay_secs).await,
        Command::Run { name } => run_now(store.as_ref(), &root, name.as_deref()).await,
        Command::Sweep => {
            let config = store.load()?;
            RetentionSweep::new(Config::projects_dir(&root))
                .sweep_all(&config)
                .await;
            println!("✅ Retention sweep finished");
            Ok(())
        }
        Command::Init { force } => init(store.as_ref(), force).await,
        Command::Seal => seal(store.as_ref()).await,
        Command::Encrypt { value } => {
            let config = store.load()?;
            if config.encrypt_key.is_empty() {
                bail!("No key material yet, run `backupx init` or `backupx seal` first");
            }
            println!("{}", encrypt(&config.encrypt_key, &value)?);
            Ok(())
        }
        Command::WebhookTest => {
            let config = store.load()?;
            let notifier = WebhookNotifier::from_config(&config.webhook)
                .ok_or_else(|| anyhow!("No webhook URL configured"))?;
            notifier.send_test().await?;
            println!("✅ Webhook test delivered");
            Ok(())
        }
    }
}

async fn serve(store: Arc<FileConfigStore>, root: &Path, delay_secs: u64) -> Result<()> {
    println!("🗄️ backupx v{}", env!("CARGO_PKG_VERSION"));
    println!("   📄 Config:   {}", store.path().display());
    println!("   📂 Projects: {}", Config::projects_dir(root).display());
    println!();

    if delay_secs > 0 {
        tracing::info!("⏳ Waiting {}s before scheduling", delay_secs);
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }

    let supervisor = Supervisor::new(store, root);
    supervisor
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start scheduler: {e}"))?;

    wait_for_signals(&supervisor).await?;
    supervisor.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(supervisor: &Supervisor) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Shutdown requested, waiting for running backups");
                return Ok(());
            }
            _ = hangup.recv() => {
                if let Err(e) = supervisor.reload().await {
                    tracing::error!("❌ Reload failed, keeping current schedule: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_supervisor: &Supervisor) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, waiting for running backups");
    Ok(())
}

async fn run_now(store: &FileConfigStore, root: &Path, name: Option<&str>) -> Result<()> {
    let config = Arc::new(store.load()?);
    let targets: Vec<&ProjectSpec> = match name {
        Some(name) => {
            let project = config
                .project(name)
                .filter(|p| p.is_runnable())
                .ok_or_else(|| anyhow!("Project {name} is not defined, disabled or malformed"))?;
            vec![project]
        }
        None => config.projects.iter().filter(|p| p.is_runnable()).collect(),
    };
    if targets.is_empty() {
        bail!("No enabled projects in {}", store.path().display());
    }

    let pipeline = ExecutionPipeline::new(Config::projects_dir(root), config.clone());
    let mut failed = 0;
    for project in targets {
        let result = pipeline.execute(project).await;
        if result.success {
            println!(
                "✅ {}: {} {}",
                result.project,
                result.file_name.as_deref().unwrap_or("-"),
                result.size_label()
            );
        } else {
            failed += 1;
            println!(
                "❌ {}: {}",
                result.project,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    pipeline.flush().await;

    if failed > 0 {
        bail!("{failed} backup(s) failed");
    }
    Ok(())
}

async fn init(store: &FileConfigStore, force: bool) -> Result<()> {
    if store.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            store.path().display()
        );
    }

    let mut example = ProjectSpec::new(
        "example",
        "head -c 4096 /dev/urandom > example-#{DATE}.bin",
    );
    example.kind = BackupKind::DatabaseDump;
    example.enabled = false;

    let mut config = Config::default();
    config.projects.push(example);
    seal_config(&mut config)?;
    store.save(&config)?;
    check_remote(&config).await;

    println!("✅ Config written to {}", store.path().display());
    Ok(())
}

async fn seal(store: &FileConfigStore) -> Result<()> {
    let mut config = store.load()?;
    let sealed = seal_config(&mut config)?;
    store.save(&config)?;
    check_remote(&config).await;
    println!("🔒 {sealed} secret(s) encrypted, config saved");
    Ok(())
}

/// Check that the configured bucket is reachable. Failures are only logged.
async fn check_remote(config: &Config) {
    match S3Store::from_config(config) {
        Ok(Some(store)) => {
            if let Err(e) = store.check_bucket().await {
                tracing::warn!("⚠️ {}", e);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("⚠️ Object storage settings unusable: {}", e),
    }
}
