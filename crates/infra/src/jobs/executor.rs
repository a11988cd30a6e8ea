//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Thread name, also used in logs.
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "side-effects".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request shutdown and wait for the in-flight job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Succeeded => self.jobs_succeeded += 1,
            JobOutcome::Retrying(_) => self.jobs_failed += 1,
            JobOutcome::DeadLettered(_) => {
                self.jobs_failed += 1;
                self.jobs_dead_lettered += 1;
            }
        }
    }
}

/// What happened to one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Failed; scheduled for another attempt.
    Retrying(String),
    /// Failed for the last time.
    DeadLettered(String),
}

/// Background job executor.
///
/// Claims jobs from a store, runs them with registered handlers, and handles
/// retries and dead-lettering.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore> core::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("JobExecutor").field("handlers", &patterns).finish_non_exhaustive()
    }
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a handler for an exact type name, a `prefix.*` category or `*`.
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Box::new(handler));
    }

    pub fn has_handler(&self, kind: &JobKind) -> bool {
        self.get_handler(kind).is_some()
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        // Longest matching category wins ("notification.*" over "*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                type_name
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h);

        category.or_else(|| self.handlers.get("*"))
    }

    /// Run the executor on a background thread until the handle shuts it down.
    pub fn spawn(self: Arc<Self>, config: JobExecutorConfig) -> io::Result<JobExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(&self, &config, &shutdown_rx, &stats_clone))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Drain up to `max_jobs` ready jobs on the calling thread.
    pub fn run_pending(&self, max_jobs: usize) -> ExecutorStats {
        let mut stats = ExecutorStats::default();
        for _ in 0..max_jobs {
            match self.store.claim_next(Utc::now()) {
                Ok(Some(mut job)) => {
                    let outcome = self.execute_one(&mut job);
                    stats.record(&outcome);
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    break;
                }
            }
        }
        stats
    }

    /// Execute a job that has already been claimed (marked running).
    pub fn execute_one(&self, job: &mut Job) -> JobOutcome {
        let started = Utc::now();

        let result = match self.get_handler(&job.kind) {
            Some(handler) => handler(job),
            None => JobResult::Abandon(format!("no handler for job kind {}", job.kind.type_name())),
        };

        let outcome = match result {
            JobResult::Success => {
                job.mark_completed(started);
                debug!(job_id = %job.id, kind = job.kind.type_name(), "job completed");
                JobOutcome::Succeeded
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    JobOutcome::DeadLettered(error)
                } else {
                    debug!(job_id = %job.id, attempt = job.attempt, error = %error, "job failed; will retry");
                    JobOutcome::Retrying(error)
                }
            }
            JobResult::Abandon(error) => {
                job.retry_policy.max_attempts = job.attempt;
                job.mark_failed(error.clone(), started);
                JobOutcome::DeadLettered(error)
            }
        };

        let persisted = match &outcome {
            JobOutcome::DeadLettered(reason) => {
                warn!(job_id = %job.id, kind = job.kind.type_name(), reason = %reason, "job dead-lettered");
                self.store.dead_letter(job.clone(), reason.clone())
            }
            _ => self.store.update(job),
        };
        if let Err(e) = persisted {
            error!(job_id = %job.id, error = %e, "failed to persist job outcome");
        }
        outcome
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    config: &JobExecutorConfig,
    shutdown_rx: &mpsc::Receiver<()>,
    stats: &Mutex<ExecutorStats>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        // Also exits if the handle was dropped without calling shutdown.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match executor.store.claim_next(Utc::now()) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
                let outcome = executor.execute_one(&mut job);
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.record(&outcome);
                s.uptime_secs = start_time.elapsed().as_secs();
            }
            Ok(None) => {
                // Sleep, but wake immediately on shutdown.
                match shutdown_rx.recv_timeout(config.poll_interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
