use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ExecutionFailure};
use crate::models::{CancelReason, ExecutionId, ExecutionRecord, ExecutionStatus, ProjectId};
use crate::runner::{OutputBuffer, RunControl};
use crate::worker::failed_record;

/// An execution handed to a worker
pub struct Claim {
    pub record: ExecutionRecord,
    pub control: Arc<RunControl>,
}

/// Result of asking the queue to cancel an execution
pub enum CancelAttempt {
    /// Removed while still QUEUED; the terminal record must be persisted
    Dequeued(ExecutionRecord),
    /// Already claimed by a worker, which has been told to stop
    Signalled {
        first: bool,
        status: watch::Receiver<ExecutionStatus>,
    },
    Terminal,
    Unknown,
}

/// Per-project FIFO lane
#[derive(Default)]
struct Lane {
    /// Queued executions with their global submission sequence number
    pending: VecDeque<(u64, ExecutionId)>,
    /// Execution currently claimed by a worker
    active: Option<ExecutionId>,
    /// Set while the project is being deleted
    closed: bool,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_none()
    }
}

struct Tracked {
    record: ExecutionRecord,
    control: Arc<RunControl>,
    output: Option<Arc<OutputBuffer>>,
    status_tx: watch::Sender<ExecutionStatus>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    lanes: HashMap<ProjectId, Lane>,
    tracked: HashMap<ExecutionId, Tracked>,
    closed: bool,
}

impl QueueState {
    /// Lane whose front execution was submitted first, skipping busy lanes
    fn oldest_ready_lane(&self) -> Option<ProjectId> {
        self.lanes
            .iter()
            .filter(|(_, lane)| lane.active.is_none() && !lane.closed)
            .filter_map(|(project, lane)| lane.pending.front().map(|(seq, _)| (*seq, *project)))
            .min()
            .map(|(_, project)| project)
    }
}

/// Registry and queue of every execution this process knows about
///
/// Enforces at most one claimed execution per project and hands out work in
/// global submission order among projects that are free to run.
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Rejects submissions the queue would not accept right now
    pub fn check_open(&self, project_id: ProjectId) -> Result<(), EngineError> {
        let state = self.state.lock();
        if state.closed {
            return Err(EngineError::ShuttingDown);
        }
        if state.lanes.get(&project_id).is_some_and(|l| l.closed) {
            return Err(EngineError::UnknownProject(project_id));
        }
        Ok(())
    }

    pub fn push(&self, record: ExecutionRecord) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::ShuttingDown);
            }
            let seq = state.next_seq;
            let lane = state.lanes.entry(record.project_id).or_default();
            if lane.closed {
                return Err(EngineError::UnknownProject(record.project_id));
            }
            lane.pending.push_back((seq, record.id));
            state.next_seq += 1;

            let (status_tx, _) = watch::channel(record.status);
            state.tracked.insert(
                record.id,
                Tracked {
                    record,
                    control: Arc::new(RunControl::new()),
                    output: None,
                    status_tx,
                },
            );
        }
        self.notify.notify_one();
        Ok(())
    }

    fn try_claim(&self) -> Option<Claim> {
        let mut state = self.state.lock();
        let project = state.oldest_ready_lane()?;
        let lane = state.lanes.get_mut(&project)?;
        let (_, id) = lane.pending.pop_front()?;
        lane.active = Some(id);

        let more = state.oldest_ready_lane().is_some();
        let tracked = state.tracked.get(&id)?;
        let claim = Claim {
            record: tracked.record.clone(),
            control: tracked.control.clone(),
        };
        drop(state);

        if more {
            self.notify.notify_one();
        }
        Some(claim)
    }

    /// Waits for the next execution a worker may run
    ///
    /// Returns `None` once `shutdown` is cancelled.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<Claim> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(claim) = self.try_claim() {
                return Some(claim);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Moves a claimed execution to RUNNING with live output attached
    pub fn start(&self, id: ExecutionId, output: Arc<OutputBuffer>) -> Option<ExecutionRecord> {
        let mut state = self.state.lock();
        let tracked = state.tracked.get_mut(&id)?;
        if !tracked
            .record
            .status
            .can_transition_to(ExecutionStatus::Running)
        {
            return None;
        }
        tracked.record.status = ExecutionStatus::Running;
        tracked.record.started_at = Some(Utc::now());
        tracked.output = Some(output);
        tracked.status_tx.send_replace(ExecutionStatus::Running);
        Some(tracked.record.clone())
    }

    /// Publishes the terminal record; the project stays busy until `settle`
    pub fn record_terminal(&self, record: ExecutionRecord) {
        let mut state = self.state.lock();
        let Some(tracked) = state.tracked.get_mut(&record.id) else {
            return;
        };
        if tracked.record.is_terminal() {
            log::warn!("Execution {} finalized twice, keeping the first result", record.id);
            return;
        }
        let status = record.status;
        tracked.record = record;
        tracked.output = None;
        tracked.status_tx.send_replace(status);
    }

    /// Frees the project's lane once the terminal record has been written
    ///
    /// Records that could not be persisted stay in the registry so callers
    /// still observe the terminal state.
    pub fn settle(&self, id: ExecutionId, persisted: bool) {
        let mut state = self.state.lock();
        let Some(project) = state.tracked.get(&id).map(|t| t.record.project_id) else {
            return;
        };
        if let Some(lane) = state.lanes.get_mut(&project) {
            if lane.active == Some(id) {
                lane.active = None;
            }
            if lane.is_idle() && !lane.closed {
                state.lanes.remove(&project);
            }
        }
        if persisted {
            state.tracked.remove(&id);
        }
        drop(state);
        self.notify.notify_one();
    }

    pub fn cancel(&self, id: ExecutionId, reason: CancelReason) -> CancelAttempt {
        let mut state = self.state.lock();
        let QueueState { lanes, tracked, .. } = &mut *state;

        let Some(tracked) = tracked.get_mut(&id) else {
            return CancelAttempt::Unknown;
        };
        if tracked.record.is_terminal() {
            return CancelAttempt::Terminal;
        }

        let first = tracked.control.cancel(reason);
        let dequeued = lanes
            .get_mut(&tracked.record.project_id)
            .and_then(|lane| {
                let pos = lane.pending.iter().position(|(_, pending)| *pending == id)?;
                lane.pending.remove(pos)
            })
            .is_some();

        if dequeued {
            let record = failed_record(&tracked.record, &ExecutionFailure::Cancelled(reason));
            tracked.record = record.clone();
            tracked.status_tx.send_replace(record.status);
            return CancelAttempt::Dequeued(record);
        }

        CancelAttempt::Signalled {
            first,
            status: tracked.status_tx.subscribe(),
        }
    }

    /// Current view of a tracked execution, including partial output
    pub fn snapshot(&self, id: ExecutionId) -> Option<ExecutionRecord> {
        let state = self.state.lock();
        let tracked = state.tracked.get(&id)?;
        let mut record = tracked.record.clone();
        if let Some(output) = &tracked.output {
            record.stdout = output.stdout();
            record.stderr = output.stderr();
        }
        Some(record)
    }

    pub fn subscribe(&self, id: ExecutionId) -> Option<watch::Receiver<ExecutionStatus>> {
        self.state
            .lock()
            .tracked
            .get(&id)
            .map(|t| t.status_tx.subscribe())
    }

    pub fn is_tracked(&self, id: ExecutionId) -> bool {
        self.state.lock().tracked.contains_key(&id)
    }

    fn unfinished_of(&self, project_id: Option<ProjectId>) -> Vec<ExecutionId> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state
            .tracked
            .values()
            .filter(|t| !t.record.is_terminal())
            .filter(|t| project_id.is_none_or(|p| t.record.project_id == p))
            .map(|t| (t.record.created_at, t.record.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Stops accepting work for `project_id` and cancels everything it has in flight
    pub fn close_project(&self, project_id: ProjectId) -> Vec<CancelAttempt> {
        self.state
            .lock()
            .lanes
            .entry(project_id)
            .or_default()
            .closed = true;

        self.unfinished_of(Some(project_id))
            .into_iter()
            .map(|id| self.cancel(id, CancelReason::ProjectDeleted))
            .collect()
    }

    /// Accepts work for `project_id` again after a failed deletion
    pub fn reopen_project(&self, project_id: ProjectId) {
        let mut state = self.state.lock();
        if let Some(lane) = state.lanes.get_mut(&project_id) {
            lane.closed = false;
            if lane.is_idle() {
                state.lanes.remove(&project_id);
            }
        }
    }

    /// Drops every trace of a deleted project
    pub fn forget_project(&self, project_id: ProjectId) {
        let mut state = self.state.lock();
        state.lanes.remove(&project_id);
        state.tracked.retain(|_, t| t.record.project_id != project_id);
    }

    /// Refuses further submissions and cancels every unfinished execution
    pub fn close(&self) -> Vec<CancelAttempt> {
        self.state.lock().closed = true;
        let attempts = self
            .unfinished_of(None)
            .into_iter()
            .map(|id| self.cancel(id, CancelReason::Shutdown))
            .collect();
        self.notify.notify_waiters();
        attempts
    }
}
