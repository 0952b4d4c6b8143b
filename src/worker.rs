use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryConfig};
use crate::error::{ExecutionFailure, StorageError};
use crate::models::{ExecutionRecord, ExecutionStatus};
use crate::monitor::UsageSnapshot;
use crate::queue::{Claim, ExecutionQueue};
use crate::runner::{OutputBuffer, RunOutcome, RunReport, Runner, signal_name};
use crate::sandbox::Provisioner;
use crate::storage::Storage;

/// Everything a worker needs, shared by the scheduler and all workers
pub struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    pub provisioner: Arc<dyn Provisioner>,
    pub runner: Runner,
    pub queue: ExecutionQueue,
    pub config: EngineConfig,
}

pub async fn worker(
    id: usize,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    while let Some(claim) = ctx.queue.pop(&token).await {
        let execution_id = claim.record.id;
        log::info!(
            "Worker {id} got execution {execution_id} of project {}",
            claim.record.project_id
        );

        let record = execute(&ctx, &claim).await;
        log::info!(
            "Execution {execution_id} finished on worker {id} with status {}",
            record.status
        );
        finalize(&ctx, record).await;
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Publishes, persists and settles a terminal record
pub async fn finalize(ctx: &WorkerContext, record: ExecutionRecord) {
    let id = record.id;
    ctx.queue.record_terminal(record.clone());
    let persisted =
        persist_terminal(ctx.storage.as_ref(), &record, &ctx.config.storage_retry).await;
    ctx.queue.settle(id, persisted);
}

/// Drives one claimed execution to its terminal record
async fn execute(ctx: &WorkerContext, claim: &Claim) -> ExecutionRecord {
    let queued = &claim.record;
    if let Some(reason) = claim.control.reason() {
        return failed_record(queued, &ExecutionFailure::Cancelled(reason));
    }

    // 1. Snapshot the project's files before the execution counts as started
    let project = match ctx.storage.get_project(queued.project_id).await {
        Ok(project) => project,
        Err(e) => return failed_record(queued, &ExecutionFailure::Storage(e)),
    };
    let files = match ctx.storage.list_files(queued.project_id).await {
        Ok(files) => files,
        Err(e) => return failed_record(queued, &ExecutionFailure::Storage(e)),
    };

    // 2. Mark RUNNING
    let output = Arc::new(OutputBuffer::new(ctx.config.output_limit.0 as usize));
    let Some(running) = ctx.queue.start(queued.id, output.clone()) else {
        return failed_record(queued, &ExecutionFailure::Interrupted);
    };
    if let Err(e) = ctx.storage.update_execution(&running).await {
        log::warn!("Failed to persist RUNNING state of execution {}: {e}", running.id);
    }

    // 3. Provision a fresh sandbox
    let env = match ctx.storage.create_environment(project.id).await {
        Ok(env) => env,
        Err(e) => return failed_record(&running, &ExecutionFailure::Storage(e)),
    };
    let handle = match ctx.provisioner.provision(&env, project.language, &files).await {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("Provisioning for execution {} failed: {e}", running.id);
            release_environment(ctx, env.id).await;
            return failed_record(&running, &ExecutionFailure::Provision(e));
        }
    };

    // 4. Run, then always tear down
    let result = ctx
        .runner
        .run(
            &handle,
            &running.entry_file,
            ctx.config.timeout_ms.into(),
            &claim.control,
            &output,
        )
        .await;

    if let Err(e) = ctx.provisioner.teardown(&handle).await {
        log::error!("Teardown of sandbox {} failed: {e}", handle.id());
    }
    release_environment(ctx, env.id).await;

    let mut captured = running.clone();
    captured.stdout = output.stdout();
    captured.stderr = output.stderr();
    match result {
        Ok(report) => terminal_record(&captured, &report),
        Err(e) => failed_record(&captured, &ExecutionFailure::Launch(e)),
    }
}

async fn release_environment(ctx: &WorkerContext, env_id: uuid::Uuid) {
    if let Err(e) = ctx.storage.release_environment(env_id).await {
        log::warn!("Failed to mark environment {env_id} released: {e}");
    }
}

fn append_annotation(stderr: &mut String, failure: &ExecutionFailure) {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&failure.annotation());
}

fn finish(record: &mut ExecutionRecord, status: ExecutionStatus, usage: &UsageSnapshot) {
    let now = Utc::now();
    record.status = status;
    record.completed_at = Some(record.started_at.map_or(now, |started| started.max(now)));
    record.memory_usage = Some(usage.memory_mb());
    record.cpu_time = Some(usage.cpu_seconds());
}

/// ERROR record for an execution that failed outside the entry process
///
/// Works from QUEUED (no `started_at`) as well as RUNNING.
pub fn failed_record(record: &ExecutionRecord, failure: &ExecutionFailure) -> ExecutionRecord {
    let mut record = record.clone();
    append_annotation(&mut record.stderr, failure);
    record.exit_code = None;
    finish(&mut record, ExecutionStatus::Error, &UsageSnapshot::default());
    record
}

/// Terminal record for an execution whose entry process was launched
pub fn terminal_record(running: &ExecutionRecord, report: &RunReport) -> ExecutionRecord {
    let mut record = running.clone();
    let failure = match report.outcome {
        RunOutcome::Exited(0) => {
            record.exit_code = Some(0);
            finish(&mut record, ExecutionStatus::Completed, &report.usage);
            return record;
        }
        RunOutcome::Exited(code) => {
            record.exit_code = Some(code);
            finish(&mut record, ExecutionStatus::Error, &report.usage);
            return record;
        }
        RunOutcome::Signaled(signal) => ExecutionFailure::Crash {
            signal,
            name: signal_name(signal),
        },
        RunOutcome::TimedOut(limit) => ExecutionFailure::Timeout(limit),
        RunOutcome::Cancelled(reason) => ExecutionFailure::Cancelled(reason),
    };

    append_annotation(&mut record.stderr, &failure);
    record.exit_code = None;
    finish(&mut record, ExecutionStatus::Error, &report.usage);
    record
}

/// Writes a terminal record, retrying with backoff
///
/// Returns false when every attempt failed, or the stored row is gone or
/// already terminal.
pub async fn persist_terminal(
    storage: &dyn Storage,
    record: &ExecutionRecord,
    retry: &RetryConfig,
) -> bool {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        match storage.update_execution(record).await {
            Ok(()) => return true,
            Err(StorageError::ExecutionNotFound(id)) => {
                log::warn!("Execution {id} vanished from storage before its result was saved");
                return false;
            }
            Err(StorageError::ExecutionTerminal(id)) => {
                log::error!(
                    "Execution {id} was already finalized in storage, keeping this result in memory only"
                );
                return false;
            }
            Err(e) if attempt < attempts => {
                let delay = retry.backoff(attempt);
                log::warn!(
                    "Saving result of execution {} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {e}",
                    record.id
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::error!(
                    "Giving up saving result of execution {} after {attempts} attempts, needs manual reconciliation: {e}",
                    record.id
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MilliSecond;
    use crate::models::CancelReason;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn running() -> ExecutionRecord {
        let mut record = ExecutionRecord::queued(uuid::Uuid::new_v4(), "main.py".to_string());
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        record
    }

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            usage: UsageSnapshot {
                cpu_time: Duration::from_millis(250),
                peak_memory: 3 * 1024 * 1024,
                samples: 2,
            },
            elapsed: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_zero_exit_completes() {
        let record = terminal_record(&running(), &report(RunOutcome::Exited(0)));
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.memory_usage, Some(3.0));
        assert_eq!(record.cpu_time, Some(0.25));
        assert!(record.completed_at >= record.started_at);
    }

    #[test]
    fn test_nonzero_exit_is_error_without_annotation() {
        let record = terminal_record(&running(), &report(RunOutcome::Exited(3)));
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.stderr, "");
    }

    #[test]
    fn test_abnormal_endings_are_annotated() {
        let mut base = running();
        base.stderr = "partial".to_string();

        let timeout = terminal_record(
            &base,
            &report(RunOutcome::TimedOut(Duration::from_secs(2))),
        );
        assert_eq!(timeout.exit_code, None);
        assert_eq!(
            timeout.stderr,
            "partial\n[rexec] timeout: exceeded time limit of 2.000s\n"
        );

        let crash = terminal_record(&base, &report(RunOutcome::Signaled(libc::SIGSEGV)));
        assert!(crash.stderr.contains("[rexec] crash:"));
        assert!(crash.stderr.contains("SIGSEGV"));

        let cancelled = terminal_record(
            &base,
            &report(RunOutcome::Cancelled(CancelReason::Operator)),
        );
        assert!(cancelled.stderr.ends_with("[rexec] cancelled: cancelled by request\n"));
        assert_eq!(cancelled.status, ExecutionStatus::Error);
    }

    #[test]
    fn test_failed_from_queued_reports_zero_usage() {
        let queued = ExecutionRecord::queued(uuid::Uuid::new_v4(), "main.py".to_string());
        let record = failed_record(&queued, &ExecutionFailure::Interrupted);
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_some());
        assert_eq!(record.memory_usage, Some(0.0));
        assert_eq!(record.cpu_time, Some(0.0));
        assert!(record.stderr.starts_with("[rexec] interrupted:"));
    }

    #[tokio::test]
    async fn test_persist_terminal_retries_then_gives_up() {
        let storage = MemoryStorage::new();
        let project = storage
            .create_project(crate::models::NewProject {
                name: "retry".to_string(),
                description: None,
                language: crate::models::Language::Python,
                owner_id: "owner".to_string(),
            })
            .await
            .unwrap();
        let record = ExecutionRecord::queued(project.id, "main.py".to_string());
        storage.create_execution(&record).await.unwrap();
        let done = failed_record(&record, &ExecutionFailure::Interrupted);

        let retry = RetryConfig {
            attempts: 3,
            initial_backoff_ms: MilliSecond(1),
            max_backoff_ms: MilliSecond(2),
        };

        storage.fail_next_updates(2);
        assert!(persist_terminal(&storage, &done, &retry).await);
        assert_eq!(
            storage.get_execution(record.id).await.unwrap().status,
            ExecutionStatus::Error
        );

        storage.fail_next_updates(3);
        assert!(!persist_terminal(&storage, &done, &retry).await);
    }

    #[tokio::test]
    async fn test_persist_terminal_never_overwrites_final_row() {
        let storage = MemoryStorage::new();
        let project = storage
            .create_project(crate::models::NewProject {
                name: "final".to_string(),
                description: None,
                language: crate::models::Language::Python,
                owner_id: "owner".to_string(),
            })
            .await
            .unwrap();
        let record = ExecutionRecord::queued(project.id, "main.py".to_string());
        storage.create_execution(&record).await.unwrap();

        let interrupted = failed_record(&record, &ExecutionFailure::Interrupted);
        storage.update_execution(&interrupted).await.unwrap();

        let mut completed = running();
        completed.id = record.id;
        completed.project_id = project.id;
        let completed = terminal_record(&completed, &report(RunOutcome::Exited(0)));
        let retry = RetryConfig {
            attempts: 3,
            initial_backoff_ms: MilliSecond(1),
            max_backoff_ms: MilliSecond(1),
        };
        assert!(!persist_terminal(&storage, &completed, &retry).await);
        assert_eq!(
            storage.get_execution(record.id).await.unwrap().status,
            ExecutionStatus::Error
        );
    }
}
