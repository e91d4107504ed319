//! Fan-out of job terminal states to interested callers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, oneshot},
    time::Instant,
};

use super::model::{Job, JobOutput, JobType};
use crate::log_warn;

const ENABLE_LOGS: bool = true;

/// Terminal updates kept for subscribers that register late.
const RECENT_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 128;
/// Registrations still unmatched after this long are dropped.
const REGISTRATION_TTL: Duration = Duration::from_secs(60 * 60);
/// Most job ids that may hold unmatched registrations at once.
const MAX_PENDING_JOBS: usize = 4096;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed { result: JobOutput },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingUpdate {
    pub job_id: String,
    pub session_id: String,
    pub job_type: JobType,
    pub retry_count: u32,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl ProcessingUpdate {
    pub fn completed(job: &Job, result: JobOutput) -> Self {
        Self::new(job, JobOutcome::Completed { result })
    }

    pub fn failed(job: &Job, error: String) -> Self {
        Self::new(job, JobOutcome::Failed { error })
    }

    fn new(job: &Job, outcome: JobOutcome) -> Self {
        Self {
            job_id: job.id.clone(),
            session_id: job.session_id.clone(),
            job_type: job.job_type(),
            retry_count: job.retry_count,
            outcome,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed { .. })
    }
}

type Callback = Box<dyn FnOnce(ProcessingUpdate) + Send + 'static>;

struct PendingCallbacks {
    registered_at: Instant,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct NotifierState {
    callbacks: HashMap<String, PendingCallbacks>,
    recent: VecDeque<ProcessingUpdate>,
}

impl NotifierState {
    /// Drop registrations whose job never reported within the TTL, then the
    /// oldest ones while the map is at capacity. Dropping a `subscribe`
    /// registration closes its receiver.
    fn expire_registrations(&mut self, now: Instant) {
        let before = self.callbacks.len();
        self.callbacks
            .retain(|_, pending| now.duration_since(pending.registered_at) < REGISTRATION_TTL);

        while self.callbacks.len() >= MAX_PENDING_JOBS {
            let oldest = self
                .callbacks
                .iter()
                .min_by_key(|(_, pending)| pending.registered_at)
                .map(|(job_id, _)| job_id.clone());
            match oldest {
                Some(job_id) => {
                    self.callbacks.remove(&job_id);
                }
                None => break,
            }
        }

        let dropped = before.saturating_sub(self.callbacks.len());
        if dropped > 0 {
            log_warn!("dropped update registrations for {dropped} job(s) that never reported");
        }
    }
}

/// Each job publishes exactly one terminal update; every callback registered
/// for that job runs once with it.
#[derive(Clone)]
pub struct ProcessingNotifier {
    state: Arc<Mutex<NotifierState>>,
    stream: broadcast::Sender<ProcessingUpdate>,
}

impl Default for ProcessingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingNotifier {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(NotifierState::default())),
            stream,
        }
    }

    /// Register `callback` for `job_id`. If the job already finished recently
    /// the callback runs immediately with the cached update. A registration
    /// that sees no update within an hour is dropped without running.
    pub fn on_processing_update<F>(&self, job_id: &str, callback: F)
    where
        F: FnOnce(ProcessingUpdate) + Send + 'static,
    {
        let cached = {
            let mut state = self.lock();
            let cached = state.recent.iter().find(|u| u.job_id == job_id).cloned();
            if cached.is_none() {
                let now = Instant::now();
                if !state.callbacks.contains_key(job_id) {
                    state.expire_registrations(now);
                }
                state
                    .callbacks
                    .entry(job_id.to_string())
                    .or_insert_with(|| PendingCallbacks {
                        registered_at: now,
                        callbacks: Vec::new(),
                    })
                    .callbacks
                    .push(Box::new(callback));
                return;
            }
            cached
        };

        if let Some(update) = cached {
            callback(update);
        }
    }

    pub fn subscribe(&self, job_id: &str) -> oneshot::Receiver<ProcessingUpdate> {
        let (tx, rx) = oneshot::channel();
        self.on_processing_update(job_id, move |update| {
            let _ = tx.send(update);
        });
        rx
    }

    /// Every terminal update, for monitoring.
    pub fn stream(&self) -> broadcast::Receiver<ProcessingUpdate> {
        self.stream.subscribe()
    }

    pub(crate) fn publish(&self, update: ProcessingUpdate) {
        let callbacks = {
            let mut state = self.lock();
            if state.recent.len() == RECENT_CAPACITY {
                state.recent.pop_front();
            }
            state.recent.push_back(update.clone());
            state
                .callbacks
                .remove(&update.job_id)
                .map(|pending| pending.callbacks)
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(update.clone());
        }

        // No receivers is fine.
        let _ = self.stream.send(update);
    }

    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn pending_registrations(&self) -> usize {
        self.lock().callbacks.len()
    }
}
