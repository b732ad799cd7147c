//! Priority job queue
//!
//! `QueueManager` owns named queues. Each queue keeps its jobs in memory,
//! mirrors every state transition to the `queue_jobs` table, and runs one
//! dispatcher task that hands ready jobs to the registered `JobHandler`
//! under a concurrency semaphore and an optional token bucket.
//!
//! Ready order: lowest priority value first, FIFO within a priority, among
//! jobs whose `scheduled_at` has passed.

pub mod job;

pub use job::{
    EnqueueOptions, ImportJobKind, JobPriority, JobState, QueueCounts, QueueJobRecord,
    ARTIST_IMPORT_QUEUE, ARTIST_SYNC_QUEUE, CATALOG_SYNC_QUEUE, VENUE_SYNC_QUEUE,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use setlist_common::config::QueueSettings;
use setlist_common::events::{EventBus, ImportEvent};
use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, Db};
use crate::error::{ImportError, ImportResult};
use crate::rate_limit::TokenBucket;

/// Dispatcher re-check interval when no job is scheduled
const IDLE_POLL: Duration = Duration::from_secs(60);

/// Work executed for jobs of one queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ImportJobKind, ctx: &JobContext) -> ImportResult<()>;

    /// Runs once when a job fails terminally (attempts exhausted, a
    /// non-retryable error, or cancellation of a waiting job)
    async fn on_failed(&self, _job: &ImportJobKind, _ctx: &JobContext, _error: &ImportError) {}
}

/// Handle given to a running job
pub struct JobContext {
    job_id: Uuid,
    queue: Arc<QueueState>,
    attempts_made: u32,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Attempt number of the current run, 1-based
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Attempts remaining after the current one
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts_left() == 0
    }

    /// Record queue-level progress (0-100) on the job record
    pub fn update_progress(&self, percent: u8) {
        let mut jobs = self.queue.jobs();
        if let Some(record) = jobs.records.get_mut(&self.job_id) {
            record.progress = percent.min(100);
        }
    }

    /// Append a line to the job log
    pub fn log(&self, message: impl Into<String>) {
        let mut jobs = self.queue.jobs();
        if let Some(record) = jobs.records.get_mut(&self.job_id) {
            record.logs.push(message.into());
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
struct Jobs {
    records: HashMap<Uuid, QueueJobRecord>,
    /// (priority value, enqueue sequence, job id) of waiting and delayed jobs
    pending: BTreeSet<(i32, u64, Uuid)>,
    next_seq: u64,
    active: HashMap<Uuid, CancellationToken>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
}

enum Ready {
    Job(QueueJobRecord, CancellationToken),
    Wait(Duration),
}

impl Jobs {
    fn push_pending(&mut self, record: &QueueJobRecord) {
        self.pending
            .insert((record.priority.value(), self.next_seq, record.job_id));
        self.next_seq += 1;
    }

    fn remove_pending(&mut self, job_id: Uuid) {
        self.pending.retain(|(_, _, id)| *id != job_id);
    }

    /// First pending entry whose time has come
    ///
    /// `Err` carries how long until the earliest delayed job is due.
    fn first_due(&self, now: DateTime<Utc>) -> Result<(i32, u64, Uuid), Duration> {
        let mut earliest: Option<DateTime<Utc>> = None;

        for entry in &self.pending {
            let Some(record) = self.records.get(&entry.2) else {
                continue;
            };
            if record.scheduled_at <= now {
                return Ok(*entry);
            }
            if earliest.map_or(true, |e| record.scheduled_at < e) {
                earliest = Some(record.scheduled_at);
            }
        }

        Err(earliest
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(IDLE_POLL))
    }

    /// Move the first eligible job to `active`, or report how long to wait
    fn claim_ready(&mut self, parent: &CancellationToken) -> Ready {
        let entry = match self.first_due(Utc::now()) {
            Ok(entry) => entry,
            Err(wait) => return Ready::Wait(wait),
        };

        self.pending.remove(&entry);
        let job_id = entry.2;
        match self.records.get_mut(&job_id) {
            Some(record) => {
                record.state = JobState::Active;
                record.attempts_made += 1;
                let token = parent.child_token();
                self.active.insert(job_id, token.clone());
                Ready::Job(record.clone(), token)
            }
            None => Ready::Wait(Duration::ZERO),
        }
    }

    /// Track a finished job and reap the oldest beyond `keep`
    fn retain_finished(&mut self, job_id: Uuid, state: JobState, keep: usize) -> Vec<Uuid> {
        let list = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        list.push_back(job_id);

        let mut reaped = Vec::new();
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                reaped.push(old);
            }
        }
        for id in &reaped {
            self.records.remove(id);
        }
        reaped
    }
}

/// How one run of a job ended
enum RunOutcome {
    Completed,
    Failed { error: ImportError, retryable: bool },
    /// Cancelled by manager shutdown; returned to waiting for recovery
    Interrupted,
}

struct Finished {
    record: QueueJobRecord,
    reaped: Vec<Uuid>,
}

struct QueueState {
    name: String,
    settings: QueueSettings,
    jobs: Mutex<Jobs>,
    wake: Notify,
    limiter: Option<TokenBucket>,
    slots: Arc<Semaphore>,
    handler: Mutex<Option<Arc<dyn JobHandler>>>,
    db: Option<Db>,
    events: Option<EventBus>,
    stopping: CancellationToken,
}

impl QueueState {
    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn handler(&self) -> Option<Arc<dyn JobHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn persist(&self, record: &QueueJobRecord) {
        if let Some(db) = &self.db {
            if let Err(e) = db::queue_jobs::upsert(db, record).await {
                warn!(
                    queue = %self.name,
                    job_id = %record.job_id,
                    error = %e,
                    "Failed to persist job record"
                );
            }
        }
    }

    fn publish(&self, record: &QueueJobRecord) {
        if let Some(bus) = &self.events {
            bus.emit_lossy(ImportEvent::QueueJobStateChanged {
                queue: self.name.clone(),
                job_id: record.job_id,
                state: record.state.to_string(),
                attempts_made: record.attempts_made,
                timestamp: Utc::now(),
            });
        }
    }

    async fn transitioned(&self, record: &QueueJobRecord) {
        self.persist(record).await;
        self.publish(record);
    }

    async fn forget(&self, reaped: &[Uuid]) {
        let Some(db) = &self.db else {
            return;
        };
        for job_id in reaped {
            if let Err(e) = db::queue_jobs::delete(db, *job_id).await {
                warn!(queue = %self.name, job_id = %job_id, error = %e, "Failed to reap job record");
            }
        }
    }

    fn finish(&self, job_id: Uuid, outcome: RunOutcome) -> Option<Finished> {
        let mut jobs = self.jobs();
        jobs.active.remove(&job_id);
        let now = Utc::now();

        let record = jobs.records.get_mut(&job_id)?;
        match outcome {
            RunOutcome::Completed => {
                record.state = JobState::Completed;
                record.progress = 100;
                record.finished_at = Some(now);
            }
            RunOutcome::Interrupted => {
                record.state = JobState::Waiting;
                record.attempts_made = record.attempts_made.saturating_sub(1);
                record.logs.push("interrupted by shutdown".to_string());
            }
            RunOutcome::Failed { error, retryable } => {
                record.last_error = Some(error.to_string());
                record
                    .logs
                    .push(format!("attempt {} failed: {}", record.attempts_made, error));
                if retryable && record.attempts_made < record.max_attempts {
                    let delay = record.backoff.delay_for(record.attempts_made);
                    record.state = JobState::Delayed;
                    record.scheduled_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::days(1));
                } else {
                    record.state = JobState::Failed;
                    record.finished_at = Some(now);
                }
            }
        }

        let snapshot = record.clone();
        let reaped = match snapshot.state {
            JobState::Completed => {
                jobs.retain_finished(job_id, JobState::Completed, self.settings.keep_completed)
            }
            JobState::Failed => {
                jobs.retain_finished(job_id, JobState::Failed, self.settings.keep_failed)
            }
            JobState::Delayed => {
                jobs.push_pending(&snapshot);
                Vec::new()
            }
            // Interrupted jobs stay out of `pending` until recovered
            JobState::Waiting | JobState::Active => Vec::new(),
        };

        Some(Finished {
            record: snapshot,
            reaped,
        })
    }
}

struct ManagerInner {
    queues: RwLock<HashMap<String, Arc<QueueState>>>,
    db: Option<Db>,
    events: Option<EventBus>,
    /// Stops dispatchers; active jobs keep running
    shutdown: CancellationToken,
    /// Parent of every active job's token
    jobs_cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Owner of all named queues and their workers
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    /// `db` enables durable job records; `events` receives state changes
    pub fn new(db: Option<Db>, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                queues: RwLock::new(HashMap::new()),
                db,
                events,
                shutdown: CancellationToken::new(),
                jobs_cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn register_queue(&self, name: &str, settings: QueueSettings) -> ImportResult<()> {
        let limiter = settings
            .rate_limit
            .map(|limit| TokenBucket::new(limit.max, Duration::from_millis(limit.duration_ms)))
            .transpose()?;

        let state = Arc::new(QueueState {
            name: name.to_string(),
            slots: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            settings,
            jobs: Mutex::new(Jobs::default()),
            wake: Notify::new(),
            limiter,
            handler: Mutex::new(None),
            db: self.inner.db.clone(),
            events: self.inner.events.clone(),
            stopping: self.inner.shutdown.clone(),
        });

        let mut queues = self.inner.queues.write().unwrap_or_else(|p| p.into_inner());
        if queues.contains_key(name) {
            return Err(ImportError::Queue(format!("queue {name} already registered")));
        }
        queues.insert(name.to_string(), state);
        debug!(queue = name, "Queue registered");
        Ok(())
    }

    fn queue_state(&self, name: &str) -> ImportResult<Arc<QueueState>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ImportError::Queue(format!("unknown queue {name}")))
    }

    fn queue_states(&self) -> Vec<Arc<QueueState>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Add a job to `queue`
    ///
    /// The record is stored durably before the job becomes eligible; a
    /// storage failure is returned and nothing is queued.
    pub async fn enqueue(
        &self,
        queue: &str,
        kind: ImportJobKind,
        options: EnqueueOptions,
    ) -> ImportResult<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ImportError::Queue("queue manager is shut down".to_string()));
        }
        let state = self.queue_state(queue)?;

        let delay = chrono::Duration::from_std(options.delay)
            .map_err(|_| ImportError::Queue(format!("delay out of range: {:?}", options.delay)))?;
        let now = Utc::now();
        let record = QueueJobRecord {
            job_id: options.job_id.unwrap_or_else(Uuid::new_v4),
            queue: queue.to_string(),
            kind,
            priority: options.priority,
            state: if options.delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            },
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(state.settings.attempts).max(1),
            backoff: options.backoff.unwrap_or(state.settings.backoff),
            progress: 0,
            logs: Vec::new(),
            last_error: None,
            created_at: now,
            scheduled_at: now + delay,
            finished_at: None,
        };
        let job_id = record.job_id;

        {
            let mut jobs = state.jobs();
            if jobs.records.contains_key(&job_id) {
                return Err(ImportError::Queue(format!("job {job_id} already exists")));
            }
            jobs.records.insert(job_id, record.clone());
        }

        if let Some(db) = &state.db {
            if let Err(e) = db::queue_jobs::insert(db, &record).await {
                state.jobs().records.remove(&job_id);
                return Err(e);
            }
        }

        state.jobs().push_pending(&record);
        state.publish(&record);
        state.wake.notify_one();

        debug!(
            queue,
            job_id = %job_id,
            priority = record.priority.value(),
            delay_ms = options.delay.as_millis() as u64,
            "Job enqueued"
        );
        Ok(job_id)
    }

    /// Enqueue on the queue the job kind belongs to
    pub async fn submit(&self, kind: ImportJobKind, options: EnqueueOptions) -> ImportResult<Uuid> {
        let queue = kind.queue_name();
        self.enqueue(queue, kind, options).await
    }

    /// Start the dispatcher of `queue` with `handler`
    pub fn process_queue(&self, queue: &str, handler: Arc<dyn JobHandler>) -> ImportResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ImportError::Queue("queue manager is shut down".to_string()));
        }
        let state = self.queue_state(queue)?;
        {
            let mut slot = state.handler.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return Err(ImportError::Queue(format!("queue {queue} already has a handler")));
            }
            *slot = Some(Arc::clone(&handler));
        }

        self.inner.tracker.spawn(dispatch(
            state,
            handler,
            self.inner.jobs_cancel.clone(),
            self.inner.tracker.clone(),
        ));
        Ok(())
    }

    /// Current record of a job, from memory or the durable store
    pub async fn job(&self, job_id: Uuid) -> ImportResult<Option<QueueJobRecord>> {
        for state in self.queue_states() {
            if let Some(record) = state.jobs().records.get(&job_id) {
                return Ok(Some(record.clone()));
            }
        }
        match &self.inner.db {
            Some(db) => db::queue_jobs::get(db, job_id).await,
            None => Ok(None),
        }
    }

    pub fn counts(&self, queue: &str) -> ImportResult<QueueCounts> {
        let state = self.queue_state(queue)?;
        let jobs = state.jobs();
        let now = Utc::now();

        let mut counts = QueueCounts::default();
        for record in jobs.records.values() {
            match record.state {
                JobState::Delayed if record.scheduled_at > now => counts.delayed += 1,
                JobState::Waiting | JobState::Delayed => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Cancel a job
    ///
    /// A waiting job fails immediately and its handler's `on_failed` runs;
    /// an active job has its cancellation token triggered. Returns `false`
    /// for jobs that already finished.
    pub async fn cancel(&self, job_id: Uuid) -> ImportResult<bool> {
        for state in self.queue_states() {
            let removed = {
                let mut jobs = state.jobs();
                if let Some(token) = jobs.active.get(&job_id) {
                    token.cancel();
                    info!(queue = %state.name, job_id = %job_id, "Active job cancellation requested");
                    return Ok(true);
                }
                let Some(record) = jobs.records.get_mut(&job_id) else {
                    continue;
                };
                if record.state.is_finished() {
                    return Ok(false);
                }
                record.state = JobState::Failed;
                record.last_error = Some(ImportError::Cancelled.to_string());
                record.finished_at = Some(Utc::now());
                let snapshot = record.clone();

                jobs.remove_pending(job_id);
                let reaped = jobs.retain_finished(job_id, JobState::Failed, state.settings.keep_failed);
                Finished {
                    record: snapshot,
                    reaped,
                }
            };

            state.transitioned(&removed.record).await;
            state.forget(&removed.reaped).await;
            info!(queue = %state.name, job_id = %job_id, "Waiting job cancelled");

            if let Some(handler) = state.handler() {
                let cancel = CancellationToken::new();
                cancel.cancel();
                let ctx = JobContext {
                    job_id,
                    queue: Arc::clone(&state),
                    attempts_made: removed.record.attempts_made,
                    max_attempts: removed.record.max_attempts,
                    cancel,
                };
                handler
                    .on_failed(&removed.record.kind, &ctx, &ImportError::Cancelled)
                    .await;
            }
            return Ok(true);
        }
        Err(ImportError::Queue(format!("unknown job {job_id}")))
    }

    /// Reload unfinished jobs of `queue` from the durable store
    ///
    /// Jobs that were active when the process stopped go back to waiting
    /// with their attempt count intact. Returns the number recovered.
    pub async fn recover_jobs(&self, queue: &str) -> ImportResult<usize> {
        let Some(db) = &self.inner.db else {
            return Ok(0);
        };
        let state = self.queue_state(queue)?;
        let rows = db::queue_jobs::list_unfinished(db, queue).await?;

        let mut recovered = Vec::new();
        {
            let mut jobs = state.jobs();
            for mut record in rows {
                if jobs.records.contains_key(&record.job_id) {
                    continue;
                }
                if record.state == JobState::Active {
                    record.state = JobState::Waiting;
                    record.logs.push("recovered after restart".to_string());
                }
                jobs.records.insert(record.job_id, record.clone());
                jobs.push_pending(&record);
                recovered.push(record);
            }
        }

        for record in &recovered {
            state.persist(record).await;
        }
        if !recovered.is_empty() {
            info!(queue, count = recovered.len(), "Recovered unfinished jobs");
            state.wake.notify_one();
        }
        Ok(recovered.len())
    }

    /// Stop dispatching and drain active jobs
    ///
    /// Jobs still running after `grace` are cancelled; they return to
    /// waiting and are picked up by `recover_jobs` on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "Queue shutdown requested");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Jobs still active after grace period, cancelling");
            self.inner.jobs_cancel.cancel();
            self.inner.tracker.wait().await;
        }
        info!("Queue shutdown complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

async fn dispatch(
    state: Arc<QueueState>,
    handler: Arc<dyn JobHandler>,
    jobs_cancel: CancellationToken,
    tracker: TaskTracker,
) {
    info!(
        queue = %state.name,
        concurrency = state.settings.concurrency,
        "Queue dispatcher started"
    );
    let stopping = state.stopping.clone();

    loop {
        let permit = tokio::select! {
            _ = stopping.cancelled() => break,
            permit = Arc::clone(&state.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = loop {
            let due = state.jobs().first_due(Utc::now());
            if let Err(wait) = due {
                tokio::select! {
                    _ = stopping.cancelled() => break None,
                    _ = state.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            // Tokens are spent only once a job is due
            if let Some(limiter) = &state.limiter {
                tokio::select! {
                    _ = stopping.cancelled() => break None,
                    _ = limiter.acquire() => {}
                }
            }

            let next = state.jobs().claim_ready(&jobs_cancel);
            match next {
                Ready::Job(record, token) => break Some((record, token)),
                // Cancelled while waiting for a token
                Ready::Wait(_) => continue,
            }
        };
        let Some((record, token)) = claimed else {
            break;
        };

        state.transitioned(&record).await;
        debug!(
            queue = %state.name,
            job_id = %record.job_id,
            attempt = record.attempts_made,
            "Job started"
        );
        tracker.spawn(run_job(
            Arc::clone(&state),
            Arc::clone(&handler),
            record,
            token,
            permit,
        ));
    }

    info!(queue = %state.name, "Queue dispatcher stopped");
}

async fn run_job(
    state: Arc<QueueState>,
    handler: Arc<dyn JobHandler>,
    record: QueueJobRecord,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = record.job_id;
    let ctx = JobContext {
        job_id,
        queue: Arc::clone(&state),
        attempts_made: record.attempts_made,
        max_attempts: record.max_attempts,
        cancel,
    };
    let started = Instant::now();

    let result = AssertUnwindSafe(handler.handle(&record.kind, &ctx))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(_)) | Err(_) if ctx.is_cancelled() && state.stopping.is_cancelled() => {
            RunOutcome::Interrupted
        }
        Ok(Err(error)) => {
            let retryable = error.is_retryable() && !ctx.is_cancelled();
            RunOutcome::Failed { error, retryable }
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(queue = %state.name, job_id = %job_id, panic = %message, "Job handler panicked");
            RunOutcome::Failed {
                error: ImportError::Queue(format!("handler panicked: {message}")),
                retryable: !ctx.is_cancelled(),
            }
        }
    };

    let last_error = match &outcome {
        RunOutcome::Failed { error, .. } => Some(error.clone()),
        _ => None,
    };
    let Some(finished) = state.finish(job_id, outcome) else {
        return;
    };
    let record = &finished.record;
    state.transitioned(record).await;
    state.forget(&finished.reaped).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match record.state {
        JobState::Completed => {
            info!(queue = %state.name, job_id = %job_id, elapsed_ms, "Job completed");
        }
        JobState::Delayed => {
            warn!(
                queue = %state.name,
                job_id = %job_id,
                attempt = record.attempts_made,
                max_attempts = record.max_attempts,
                error = record.last_error.as_deref().unwrap_or(""),
                "Job failed, retry scheduled"
            );
            state.wake.notify_one();
        }
        JobState::Failed => {
            error!(
                queue = %state.name,
                job_id = %job_id,
                attempts = record.attempts_made,
                error = record.last_error.as_deref().unwrap_or(""),
                "Job failed"
            );
            let last = last_error.unwrap_or(ImportError::Cancelled);
            if AssertUnwindSafe(handler.on_failed(&record.kind, &ctx, &last))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(queue = %state.name, job_id = %job_id, "on_failed hook panicked");
            }
        }
        JobState::Waiting | JobState::Active => {
            info!(queue = %state.name, job_id = %job_id, "Job interrupted by shutdown");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Dependency;
    use crate::db::in_memory_pool;
    use setlist_common::config::{BackoffSettings, RateLimitSettings};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts with `error`, then succeeds
    struct ScriptedHandler {
        failures: u32,
        error: Option<ImportError>,
        panic_first: bool,
        calls: AtomicU32,
        seen: Mutex<Vec<Uuid>>,
        failed: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn succeeding() -> Self {
            Self {
                failures: 0,
                error: None,
                panic_first: false,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
            }
        }

        fn failing(failures: u32, error: ImportError) -> Self {
            Self {
                failures,
                error: Some(error),
                ..Self::succeeding()
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &ImportJobKind, ctx: &JobContext) -> ImportResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push(job.artist_id());
            ctx.update_progress(50);
            ctx.log(format!("attempt {}", ctx.attempts_made()));
            if self.panic_first && call == 1 {
                panic!("scripted panic");
            }
            match &self.error {
                Some(e) if call <= self.failures => Err(e.clone()),
                _ => Ok(()),
            }
        }

        async fn on_failed(&self, _job: &ImportJobKind, _ctx: &JobContext, error: &ImportError) {
            self.failed.lock().unwrap().push(error.to_string());
        }
    }

    fn settings(concurrency: usize, attempts: u32) -> QueueSettings {
        QueueSettings {
            concurrency,
            rate_limit: None,
            attempts,
            backoff: BackoffSettings::Fixed { delay_ms: 10 },
            keep_completed: 100,
            keep_failed: 100,
        }
    }

    fn sync_job(artist_id: Uuid) -> ImportJobKind {
        ImportJobKind::ArtistSync { artist_id }
    }

    async fn wait_for_state(manager: &QueueManager, job_id: Uuid, state: JobState) -> QueueJobRecord {
        for _ in 0..400 {
            if let Some(record) = manager.job(job_id).await.unwrap() {
                if record.state == state {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {state}");
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 1)).unwrap();

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let plan = [
            (ids[0], JobPriority::Low),
            (ids[1], JobPriority::Normal),
            (ids[2], JobPriority::Critical),
            (ids[3], JobPriority::Normal),
            (ids[4], JobPriority::High),
        ];
        let mut last = None;
        for (artist_id, priority) in plan {
            last = Some(
                manager
                    .enqueue(
                        ARTIST_SYNC_QUEUE,
                        sync_job(artist_id),
                        EnqueueOptions::default().with_priority(priority),
                    )
                    .await
                    .unwrap(),
            );
        }

        let handler = Arc::new(ScriptedHandler::succeeding());
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();
        wait_for_state(&manager, last.unwrap(), JobState::Completed).await;
        for _ in 0..200 {
            if manager.counts(ARTIST_SYNC_QUEUE).unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![ids[2], ids[4], ids[1], ids[3], ids[0]]);
        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(2, 3)).unwrap();
        let handler = Arc::new(ScriptedHandler::failing(
            2,
            ImportError::transient(Dependency::Ticketing, "502"),
        ));
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let job_id = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        let record = wait_for_state(&manager, job_id, JobState::Completed).await;

        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.progress, 100);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handler.failed.lock().unwrap().is_empty());
        assert!(record.logs.iter().any(|l| l.contains("attempt 1 failed")));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_runs_on_failed_once() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 2)).unwrap();
        let handler = Arc::new(ScriptedHandler::failing(
            u32::MAX,
            ImportError::transient(Dependency::Ticketing, "timeout"),
        ));
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let job_id = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        let record = wait_for_state(&manager, job_id, JobState::Failed).await;

        assert_eq!(record.attempts_made, 2);
        assert_eq!(record.attempts_left(), 0);
        for _ in 0..100 {
            if !handler.failed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.failed.lock().unwrap().len(), 1);
        assert_eq!(manager.counts(ARTIST_SYNC_QUEUE).unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 5)).unwrap();
        let handler = Arc::new(ScriptedHandler::failing(
            u32::MAX,
            ImportError::not_found(Dependency::Ticketing, "attraction"),
        ));
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let job_id = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        let record = wait_for_state(&manager, job_id, JobState::Failed).await;
        assert_eq!(record.attempts_made, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_worker() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 2)).unwrap();
        let handler = Arc::new(ScriptedHandler {
            panic_first: true,
            ..ScriptedHandler::succeeding()
        });
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let job_id = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        let record = wait_for_state(&manager, job_id, JobState::Completed).await;
        assert_eq!(record.attempts_made, 2);
        assert!(record.logs.iter().any(|l| l.contains("panicked")));
    }

    #[tokio::test]
    async fn test_delayed_job_not_run_early() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 1)).unwrap();
        let handler = Arc::new(ScriptedHandler::succeeding());
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let job_id = manager
            .submit(
                sync_job(Uuid::new_v4()),
                EnqueueOptions::default().with_delay(Duration::from_millis(150)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.counts(ARTIST_SYNC_QUEUE).unwrap().delayed, 1);

        wait_for_state(&manager, job_id, JobState::Completed).await;
    }

    #[tokio::test]
    async fn test_queue_rate_limit_spaces_dispatch() {
        let manager = QueueManager::new(None, None);
        let mut limited = settings(4, 1);
        limited.rate_limit = Some(RateLimitSettings {
            max: 1,
            duration_ms: 60_000,
        });
        manager.register_queue(ARTIST_SYNC_QUEUE, limited).unwrap();
        let handler = Arc::new(ScriptedHandler::succeeding());
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        let first = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();

        wait_for_state(&manager, first, JobState::Completed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.counts(ARTIST_SYNC_QUEUE).unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_idle_queue_keeps_rate_limit_tokens() {
        let manager = QueueManager::new(None, None);
        let mut limited = settings(1, 1);
        limited.rate_limit = Some(RateLimitSettings {
            max: 1,
            duration_ms: 60_000,
        });
        manager.register_queue(ARTIST_SYNC_QUEUE, limited).unwrap();
        manager
            .process_queue(ARTIST_SYNC_QUEUE, Arc::new(ScriptedHandler::succeeding()))
            .unwrap();

        // Dispatcher has been idle long enough to reach its wait
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = manager.queue_state(ARTIST_SYNC_QUEUE).unwrap();
        let limiter = state.limiter.as_ref().unwrap();
        assert!(limiter.try_acquire(), "idle dispatcher spent the only token");
        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_queue_and_duplicate_id() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 1)).unwrap();

        let err = manager
            .enqueue("nope", sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Queue(_)));

        let job_id = Uuid::new_v4();
        manager
            .enqueue(
                ARTIST_SYNC_QUEUE,
                sync_job(Uuid::new_v4()),
                EnqueueOptions::default().with_job_id(job_id),
            )
            .await
            .unwrap();
        let err = manager
            .enqueue(
                ARTIST_SYNC_QUEUE,
                sync_job(Uuid::new_v4()),
                EnqueueOptions::default().with_job_id(job_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Queue(_)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_job_runs_on_failed() {
        let manager = QueueManager::new(None, None);
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 3)).unwrap();
        let handler = Arc::new(ScriptedHandler::succeeding());
        let job_id = manager
            .submit(
                sync_job(Uuid::new_v4()),
                EnqueueOptions::default().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        manager
            .process_queue(ARTIST_SYNC_QUEUE, handler.clone())
            .unwrap();

        assert!(manager.cancel(job_id).await.unwrap());
        let record = manager.job(job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(handler.failed.lock().unwrap().len(), 1);
        assert!(!manager.cancel(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_reaps_oldest_completed() {
        let manager = QueueManager::new(None, None);
        let mut keep_one = settings(1, 1);
        keep_one.keep_completed = 1;
        manager.register_queue(ARTIST_SYNC_QUEUE, keep_one).unwrap();
        manager
            .process_queue(ARTIST_SYNC_QUEUE, Arc::new(ScriptedHandler::succeeding()))
            .unwrap();

        let first = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        wait_for_state(&manager, first, JobState::Completed).await;
        let second = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        wait_for_state(&manager, second, JobState::Completed).await;

        assert!(manager.job(first).await.unwrap().is_none());
        assert_eq!(manager.counts(ARTIST_SYNC_QUEUE).unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_unfinished_jobs_recovered_from_store() {
        let db = Db::new(in_memory_pool().await.unwrap(), 1000);

        let first = QueueManager::new(Some(db.clone()), None);
        first.register_queue(ARTIST_SYNC_QUEUE, settings(1, 3)).unwrap();
        let job_id = first
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();
        first.shutdown(Duration::from_millis(10)).await;

        let second = QueueManager::new(Some(db.clone()), None);
        second.register_queue(ARTIST_SYNC_QUEUE, settings(1, 3)).unwrap();
        assert_eq!(second.recover_jobs(ARTIST_SYNC_QUEUE).await.unwrap(), 1);
        second
            .process_queue(ARTIST_SYNC_QUEUE, Arc::new(ScriptedHandler::succeeding()))
            .unwrap();
        wait_for_state(&second, job_id, JobState::Completed).await;

        let stored = db::queue_jobs::get(&db, job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_state_changes_published() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let manager = QueueManager::new(None, Some(bus));
        manager.register_queue(ARTIST_SYNC_QUEUE, settings(1, 1)).unwrap();
        manager
            .process_queue(ARTIST_SYNC_QUEUE, Arc::new(ScriptedHandler::succeeding()))
            .unwrap();
        let job_id = manager
            .submit(sync_job(Uuid::new_v4()), EnqueueOptions::default())
            .await
            .unwrap();

        let mut states = Vec::new();
        while states.last().map(String::as_str) != Some("completed") {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ImportEvent::QueueJobStateChanged { job_id: id, state, .. } = event {
                assert_eq!(id, job_id);
                states.push(state);
            }
        }
        assert_eq!(states, vec!["waiting", "active", "completed"]);
    }
}
