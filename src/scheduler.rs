use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, ExecutionFailure, StorageError};
use crate::lease::EngineLease;
use crate::models::{
    CancelReason, ExecutionId, ExecutionRecord, ExecutionSnapshot, ExecutionStatus, ProjectId,
    normalize_file_path,
};
use crate::queue::{CancelAttempt, ExecutionQueue};
use crate::runner::Runner;
use crate::sandbox::Provisioner;
use crate::storage::Storage;
use crate::worker::{WorkerContext, failed_record, persist_terminal, worker};

/// Admission control and lifecycle owner of every execution
///
/// `submit` never blocks on sandbox availability: it records the execution as
/// QUEUED and a pool of `workers` tasks picks executions up, at most one per
/// project at a time and oldest submission first across projects.
pub struct Scheduler {
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
    workers: Mutex<Option<JoinSet<anyhow::Result<()>>>>,
    lease: Option<EngineLease>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        provisioner: Arc<dyn Provisioner>,
        runner: Runner,
        config: EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                storage,
                provisioner,
                runner,
                queue: ExecutionQueue::new(),
                config,
            }),
            token: CancellationToken::new(),
            workers: Mutex::new(None),
            lease: None,
        }
    }

    /// Registers this scheduler among the engines sharing its storage
    ///
    /// Without a lease the scheduler assumes it is the only engine, and
    /// `reconcile` treats every untracked unfinished execution as orphaned.
    pub fn with_lease(mut self, lease: EngineLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Spawns the worker pool; calling it again has no effect
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }

        let n_workers = self.ctx.config.workers.max(1);
        let mut set = JoinSet::new();
        for i in 1..=n_workers {
            set.spawn(worker(i, self.ctx.clone(), self.token.clone()));
        }
        log::info!("Scheduler started with {n_workers} workers");
        *workers = Some(set);
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.ctx.storage
    }

    /// Queues an execution of `entry_file` (or the language's default entry)
    pub async fn submit(
        &self,
        project_id: ProjectId,
        entry_file: Option<&str>,
    ) -> Result<ExecutionId, EngineError> {
        self.ctx.queue.check_open(project_id)?;
        let project = self.ctx.storage.get_project(project_id).await?;

        let requested = entry_file.unwrap_or(project.language.default_entry());
        let entry = normalize_file_path(requested)
            .ok_or_else(|| EngineError::InvalidEntry(requested.to_string()))?;

        let record = ExecutionRecord::queued(project_id, entry);
        let id = record.id;
        self.ctx.storage.create_execution(&record).await?;

        if let Err(e) = self.ctx.queue.push(record.clone()) {
            // Lost a race with shutdown or deletion; never leave the row QUEUED
            let reason = match e {
                EngineError::ShuttingDown => CancelReason::Shutdown,
                _ => CancelReason::ProjectDeleted,
            };
            let cancelled = failed_record(&record, &ExecutionFailure::Cancelled(reason));
            persist_terminal(
                self.ctx.storage.as_ref(),
                &cancelled,
                &self.ctx.config.storage_retry,
            )
            .await;
            return Err(e);
        }

        log::info!("Execution {id} of project {project_id} queued");
        Ok(id)
    }

    pub async fn get_status(&self, id: ExecutionId) -> Result<ExecutionSnapshot, EngineError> {
        if let Some(record) = self.ctx.queue.snapshot(id) {
            return Ok(record);
        }
        Ok(self.ctx.storage.get_execution(id).await?)
    }

    /// Watch channel of the execution's status
    pub async fn subscribe(
        &self,
        id: ExecutionId,
    ) -> Result<watch::Receiver<ExecutionStatus>, EngineError> {
        if let Some(rx) = self.ctx.queue.subscribe(id) {
            return Ok(rx);
        }
        let record = self.ctx.storage.get_execution(id).await?;
        let (_, rx) = watch::channel(record.status);
        Ok(rx)
    }

    /// Resolves with the terminal record of the execution
    pub async fn wait(&self, id: ExecutionId) -> Result<ExecutionSnapshot, EngineError> {
        if let Some(mut rx) = self.ctx.queue.subscribe(id) {
            // An error means the registry dropped the entry, which only happens once terminal
            let _ = rx.wait_for(ExecutionStatus::is_terminal).await;
        }
        self.get_status(id).await
    }

    /// Cancels a QUEUED or RUNNING execution
    ///
    /// A QUEUED execution becomes ERROR immediately. A RUNNING one is
    /// terminated and the call returns once its terminal record is published.
    /// Later calls fail with `AlreadyTerminal`.
    pub async fn cancel(&self, id: ExecutionId) -> Result<(), EngineError> {
        match self.ctx.queue.cancel(id, CancelReason::Operator) {
            CancelAttempt::Dequeued(record) => {
                log::info!("Execution {id} cancelled while queued");
                self.finalize_dequeued(record).await;
                Ok(())
            }
            CancelAttempt::Signalled { first, mut status } => {
                log::info!("Execution {id} cancellation requested");
                let _ = status.wait_for(ExecutionStatus::is_terminal).await;
                if first {
                    Ok(())
                } else {
                    Err(EngineError::AlreadyTerminal(id))
                }
            }
            CancelAttempt::Terminal => Err(EngineError::AlreadyTerminal(id)),
            CancelAttempt::Unknown => {
                let record = self.ctx.storage.get_execution(id).await?;
                if record.is_terminal() {
                    return Err(EngineError::AlreadyTerminal(id));
                }
                // Left unfinished by an earlier process and never reconciled
                let cancelled =
                    failed_record(&record, &ExecutionFailure::Cancelled(CancelReason::Operator));
                if !persist_terminal(
                    self.ctx.storage.as_ref(),
                    &cancelled,
                    &self.ctx.config.storage_retry,
                )
                .await
                {
                    return Err(EngineError::Storage(StorageError::Unavailable(format!(
                        "could not record cancellation of execution {id}"
                    ))));
                }
                Ok(())
            }
        }
    }

    async fn finalize_dequeued(&self, record: ExecutionRecord) {
        let id = record.id;
        let persisted = persist_terminal(
            self.ctx.storage.as_ref(),
            &record,
            &self.ctx.config.storage_retry,
        )
        .await;
        self.ctx.queue.settle(id, persisted);
    }

    /// Cancels everything the project has in flight, then deletes it
    pub async fn delete_project(&self, project_id: ProjectId) -> Result<(), EngineError> {
        let attempts = self.ctx.queue.close_project(project_id);
        log::info!(
            "Deleting project {project_id}, cancelling {} executions",
            attempts.len()
        );

        for attempt in attempts {
            match attempt {
                CancelAttempt::Dequeued(record) => self.finalize_dequeued(record).await,
                CancelAttempt::Signalled { mut status, .. } => {
                    let _ = status.wait_for(ExecutionStatus::is_terminal).await;
                }
                CancelAttempt::Terminal | CancelAttempt::Unknown => {}
            }
        }

        if let Err(e) = self.ctx.storage.delete_project(project_id).await {
            self.ctx.queue.reopen_project(project_id);
            return Err(e.into());
        }
        self.ctx.queue.forget_project(project_id);
        Ok(())
    }

    /// Marks executions left QUEUED or RUNNING by an earlier process as ERROR
    ///
    /// Skipped while another engine holds a lease on the same storage, since
    /// the unfinished rows may be its live executions. Returns how many
    /// records were repaired.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        // Listed before the liveness check: rows of an engine that starts later
        // are never in the list
        let orphans = self.ctx.storage.list_unfinished_executions().await?;
        if let Some(lease) = &self.lease {
            match lease.others_alive() {
                Ok(false) => {}
                Ok(true) => {
                    log::info!(
                        "Another engine shares this storage, leaving {} unfinished executions alone",
                        orphans.len()
                    );
                    return Ok(0);
                }
                Err(e) => {
                    log::warn!("Could not check for other engines, skipping reconciliation: {e}");
                    return Ok(0);
                }
            }
        }

        let mut repaired = 0;
        for record in orphans {
            if self.ctx.queue.is_tracked(record.id) {
                continue;
            }
            log::warn!(
                "Execution {} was left {} by a previous run, marking it ERROR",
                record.id,
                record.status
            );
            let failed = failed_record(&record, &ExecutionFailure::Interrupted);
            if persist_terminal(
                self.ctx.storage.as_ref(),
                &failed,
                &self.ctx.config.storage_retry,
            )
            .await
            {
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    /// Stops the worker pool
    ///
    /// Running executions are terminated and queued ones become ERROR; every
    /// record is terminal once this returns.
    pub async fn shutdown(&self) {
        let attempts = self.ctx.queue.close();
        log::info!("Shutting down scheduler, cancelling {} executions", attempts.len());

        for attempt in attempts {
            if let CancelAttempt::Dequeued(record) = attempt {
                self.finalize_dequeued(record).await;
            }
        }

        self.token.cancel();
        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            while let Some(res) = workers.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
                    Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
                    Err(e) => log::error!("Worker handle finished with error: {e:?}"),
                }
            }
        }
        log::info!("Scheduler shut down");
    }
}
