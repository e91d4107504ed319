//! Worker dispatcher: pulls ready jobs on a fixed tick, runs them as
//! independent tasks and owns the retry-or-fail decision.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::settings::PipelineSettings;
use crate::{log_debug, log_error, log_info, log_warn};

use super::model::{Job, JobOutput, JobStatus, JobType};
use super::notifier::{ProcessingNotifier, ProcessingUpdate};
use super::queue::JobQueue;

const ENABLE_LOGS: bool = true;

/// Longest backoff a single retry will wait, whatever the retry count.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Executes one job. Implementations report failure by returning an error or
/// by panicking; the scheduler treats both the same way.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<JobOutput>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub tick_interval: Duration,
    pub backoff_unit: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_concurrent_jobs: settings.max_concurrent_jobs.max(1),
            tick_interval: settings.tick_interval(),
            backoff_unit: settings.backoff_unit(),
        }
    }

    /// `backoff_unit * 2^retry_count`, evaluated before the count is bumped.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(1u32 << retry_count.min(MAX_BACKOFF_EXPONENT))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub pending: usize,
    pub active: usize,
    pub retrying: usize,
}

#[derive(Default)]
struct SchedulerState {
    queue: JobQueue,
    active: HashMap<String, Job>,
    /// Live `session_complete` job per session, from submit until its
    /// terminal update.
    pipelines: HashMap<String, String>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    handler: Arc<dyn JobHandler>,
    notifier: ProcessingNotifier,
    state: Mutex<SchedulerState>,
    retrying: AtomicUsize,
    cancel_token: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// One per process; clones share the same queue and active set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
        notifier: ProcessingNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                handler,
                notifier,
                state: Mutex::new(SchedulerState::default()),
                retrying: AtomicUsize::new(0),
                cancel_token: CancellationToken::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn notifier(&self) -> &ProcessingNotifier {
        &self.inner.notifier
    }

    /// Queue a job; it is picked up on the next tick with a free slot.
    ///
    /// A session runs at most one pipeline at a time: while a
    /// `session_complete` job for it is queued, running or waiting to retry,
    /// another one is not queued and the existing job id is returned.
    pub fn submit(&self, job: Job) -> String {
        let mut state = self.inner.lock();
        if job.job_type() == JobType::SessionComplete {
            if let Some(existing) = state.pipelines.get(&job.session_id) {
                log_info!(
                    "session {} already has pipeline job {}, not queueing another",
                    job.session_id,
                    existing
                );
                return existing.clone();
            }
            state
                .pipelines
                .insert(job.session_id.clone(), job.id.clone());
        }

        let job_id = job.id.clone();
        log_debug!(
            "queued {} job {} for session {} (priority {})",
            job.job_type(),
            job.id,
            job.session_id,
            job.priority
        );
        state.queue.push(job);
        job_id
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.lock();
        SchedulerStats {
            pending: state.queue.len(),
            active: state.active.len(),
            retrying: self.inner.retrying.load(Ordering::SeqCst),
        }
    }

    /// Spawn the tick loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ticker.is_some() {
            return;
        }

        let scheduler = self.clone();
        *ticker = Some(tokio::spawn(async move { scheduler.tick_loop().await }));
        log_info!(
            "scheduler started (max {} concurrent jobs, tick {}ms)",
            self.inner.config.max_concurrent_jobs,
            self.inner.config.tick_interval.as_millis()
        );
    }

    /// Stop ticking and drop pending backoff timers. Handlers already running
    /// are left to finish; there is no mid-flight cancellation.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let handle = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log_error!("scheduler tick loop failed to join: {err}");
            }
        }
    }

    async fn tick_loop(self) {
        let mut ticker = time::interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_ready(),
                _ = self.inner.cancel_token.cancelled() => {
                    log_info!("scheduler tick loop shutting down");
                    break;
                }
            }
        }
    }

    /// Fill free slots from the queue. Never awaits; handlers run on their own tasks.
    fn dispatch_ready(&self) {
        let ready = {
            let mut state = self.inner.lock();
            let free = self
                .inner
                .config
                .max_concurrent_jobs
                .saturating_sub(state.active.len());
            let mut ready = state.queue.pop_available(free);
            for job in &mut ready {
                job.set_status(JobStatus::Processing);
                state.active.insert(job.id.clone(), job.clone());
            }
            ready
        };

        for job in ready {
            log_debug!(
                "dispatching {} job {} (attempt {})",
                job.job_type(),
                job.id,
                job.retry_count + 1
            );
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_job(job).await });
        }
    }

    async fn run_job(self, job: Job) {
        let handler = Arc::clone(&self.inner.handler);
        let job_for_handler = job.clone();

        // A separate task turns a panicking handler into a JoinError
        // instead of tearing down this bookkeeping task.
        let outcome = match tokio::spawn(async move { handler.handle(&job_for_handler).await })
            .await
        {
            Ok(result) => result,
            Err(join_err) => Err(PipelineError::HandlerPanicked(join_err.to_string())),
        };

        self.finish(job, outcome);
    }

    fn finish(&self, mut job: Job, outcome: Result<JobOutput>) {
        self.inner.lock().active.remove(&job.id);

        match outcome {
            Ok(output) => {
                job.set_status(JobStatus::Completed);
                self.inner.release_pipeline(&job);
                log_info!(
                    "{} job {} for session {} completed (retries: {})",
                    job.job_type(),
                    job.id,
                    job.session_id,
                    job.retry_count
                );
                self.inner
                    .notifier
                    .publish(ProcessingUpdate::completed(&job, output));
            }
            Err(err) => {
                job.set_status(JobStatus::Failed);
                job.last_error = Some(err.to_string());

                if err.is_retryable() && job.retries_remaining() {
                    let delay = self.inner.config.backoff_for(job.retry_count);
                    job.retry_count += 1;
                    log_warn!(
                        "{} job {} failed (retry {}/{} in {}ms): {err}",
                        job.job_type(),
                        job.id,
                        job.retry_count,
                        job.max_retries,
                        delay.as_millis()
                    );
                    self.schedule_retry(job, delay);
                } else {
                    self.inner.release_pipeline(&job);
                    log_error!(
                        "{} job {} for session {} failed permanently after {} retries: {err}",
                        job.job_type(),
                        job.id,
                        job.session_id,
                        job.retry_count
                    );
                    self.inner
                        .notifier
                        .publish(ProcessingUpdate::failed(&job, err.to_string()));
                }
            }
        }
    }

    fn schedule_retry(&self, job: Job, delay: Duration) {
        self.inner.retrying.fetch_add(1, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    scheduler.inner.lock().queue.push(job);
                }
                _ = scheduler.inner.cancel_token.cancelled() => {
                    scheduler.inner.release_pipeline(&job);
                    log_warn!("dropping retry of job {} on shutdown", job.id);
                }
            }
            scheduler.inner.retrying.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allow a new pipeline for the job's session once this one is done.
    fn release_pipeline(&self, job: &Job) {
        if job.job_type() != JobType::SessionComplete {
            return;
        }
        let mut state = self.lock();
        if state.pipelines.get(&job.session_id) == Some(&job.id) {
            state.pipelines.remove(&job.session_id);
        }
    }
}
