use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use rexec::config::{CliArgs, Command, MilliSecond};
use rexec::database::{self as db, SqliteStorage};
use rexec::lease::EngineLease;
use rexec::models::{ExecutionStatus, NewFile, NewProject};
use rexec::monitor::ResourceMonitor;
use rexec::runner::Runner;
use rexec::sandbox::create_provisioner;
use rexec::{Scheduler, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let mut config = cli.to_config().context("Failed to load configuration")?;
    if config.engine.workers == 0 {
        bail!("The number of workers must not be 0");
    }

    let db_path = db::get_db_path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let storage = Arc::new(
        SqliteStorage::open(&db_path)
            .await
            .context("Failed to initialize database")?,
    );

    let Command::Run {
        dir,
        language,
        entry,
        timeout_ms,
    } = cli.command;
    if let Some(ms) = timeout_ms {
        config.engine.timeout_ms = MilliSecond(ms);
    }

    let provisioner = Arc::new(create_provisioner(&config.sandbox, config.languages.clone())?);
    let runner = Runner::new(
        config.engine.grace_period_ms.into(),
        ResourceMonitor::procfs(config.engine.sample_interval_ms.into()),
    );

    // ======= PREPARATION END, EXECUTION START =======

    // Every engine on this database registers, so reconcile never touches live executions
    let lease = EngineLease::acquire(db_path.with_extension("engines"))
        .context("Failed to register engine")?;
    log::info!("Engine {} attached to {}", lease.id(), db_path.display());

    let scheduler = Scheduler::new(storage.clone(), provisioner, runner, config.engine.clone())
        .with_lease(lease);
    scheduler.start();
    let repaired = scheduler.reconcile().await?;
    if repaired > 0 {
        log::warn!("Marked {repaired} interrupted executions as ERROR");
    }

    let project = storage
        .create_project(NewProject {
            name: project_name(&dir),
            description: Some(format!("Imported from {}", dir.display())),
            language,
            owner_id: std::env::var("USER").unwrap_or_else(|_| "rexec".to_string()),
        })
        .await?;

    let mut files = Vec::new();
    collect_files(&dir, &dir, &mut files)?;
    log::info!("Importing {} files into project {}", files.len(), project.id);
    for (path, content) in files {
        storage
            .save_file(NewFile {
                project_id: project.id,
                path,
                content,
            })
            .await?;
    }

    let execution_id = scheduler.submit(project.id, entry.as_deref()).await?;

    // ===== EXECUTION END, WAITING FOR RESULT ======

    let record = tokio::select! {
        record = scheduler.wait(execution_id) => record?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, cancelling execution {execution_id}...");
            if let Err(e) = scheduler.cancel(execution_id).await {
                log::warn!("Cancellation of {execution_id} failed: {e}");
            }
            scheduler.wait(execution_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&record)?);

    scheduler.shutdown().await;
    log::info!("Shutdown complete");

    if record.status != ExecutionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn project_name(dir: &Path) -> String {
    dir.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string())
}

/// Reads every regular UTF-8 file below `dir`, skipping hidden entries
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("Reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let Ok(content) = std::fs::read_to_string(&path) else {
                log::warn!("Skipping non-UTF-8 file {}", path.display());
                continue;
            };
            let relative = path.strip_prefix(root)?.to_string_lossy().into_owned();
            out.push((relative, content));
        }
    }
    Ok(())
}
