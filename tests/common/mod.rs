#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sessionflow::db::{Session, SessionStatus};
use sessionflow::pipeline::{
    ArchiveReceipt, Archiver, Collaborators, ContextEnhancer, QualityAssessment, QualityControl,
    TrainingGenerator, TrainingOutput, ValidationMetrics, ValidationReport, Validator,
};
use sessionflow::{PipelineSettings, ProcessingUpdate, SessionStore};
use tokio::sync::broadcast;

/// Short timings so pipeline runs finish in milliseconds.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        tick_interval_ms: 5,
        backoff_unit_ms: 5,
        batch_window_ms: 20,
        stage_timeout_ms: 2_000,
        max_retries: 1,
        ..PipelineSettings::default()
    }
}

pub struct FakeValidator {
    pub score: f64,
    pub calls: AtomicU32,
}

#[async_trait]
impl Validator for FakeValidator {
    async fn validate_session(&self, _session_id: &str) -> Result<ValidationReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationReport {
            is_valid: self.score >= 50.0,
            overall_score: self.score,
            errors: Vec::new(),
            metrics: ValidationMetrics {
                completeness_score: 0.9,
                reliability_score: 0.8,
            },
        })
    }
}

pub struct FakeQuality {
    pub calls: AtomicU32,
}

#[async_trait]
impl QualityControl for FakeQuality {
    async fn assess_session(&self, _session_id: &str) -> Result<QualityAssessment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(QualityAssessment {
            overall_score: 72.0,
            completeness_score: 0.9,
            reliability_score: 0.8,
        })
    }
}

pub struct FakeEnhancer {
    pub delay: Duration,
    pub calls: AtomicU32,
}

#[async_trait]
impl ContextEnhancer for FakeEnhancer {
    async fn enhance_session_context(&self, session_id: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "sessionId": session_id, "pageType": "checkout" }))
    }
}

/// Replays a fixed generator response; fails the first `failures` calls.
pub struct FakeTrainer {
    pub output: Value,
    pub failures: u32,
    pub calls: AtomicU32,
}

#[async_trait]
impl TrainingGenerator for FakeTrainer {
    async fn generate_training_data(&self, session: &Session) -> Result<TrainingOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(anyhow!("generator unavailable for {}", session.id));
        }
        Ok(serde_json::from_value(self.output.clone())?)
    }
}

pub struct FakeArchiver {
    pub calls: AtomicU32,
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn create_session_archive(&self, session_id: &str) -> Result<ArchiveReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArchiveReceipt {
            archive_ref: format!("archive://{session_id}"),
        })
    }
}

pub struct Fakes {
    pub validator: Arc<FakeValidator>,
    pub quality: Arc<FakeQuality>,
    pub enhancer: Arc<FakeEnhancer>,
    pub trainer: Arc<FakeTrainer>,
    pub archiver: Arc<FakeArchiver>,
}

impl Fakes {
    pub fn new(score: f64, training_output: Value) -> Self {
        Self {
            validator: Arc::new(FakeValidator {
                score,
                calls: AtomicU32::new(0),
            }),
            quality: Arc::new(FakeQuality {
                calls: AtomicU32::new(0),
            }),
            enhancer: Arc::new(FakeEnhancer {
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }),
            trainer: Arc::new(FakeTrainer {
                output: training_output,
                failures: 0,
                calls: AtomicU32::new(0),
            }),
            archiver: Arc::new(FakeArchiver {
                calls: AtomicU32::new(0),
            }),
        }
    }

    pub fn healthy() -> Self {
        Self::new(80.0, json!({ "examples": ["a", "b"], "trainingValue": 0.6 }))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.validator.clone(),
            self.quality.clone(),
            self.enhancer.clone(),
            self.trainer.clone(),
        )
        .with_archiver(self.archiver.clone())
    }
}

pub fn calls(counter: &AtomicU32) -> u32 {
    counter.load(Ordering::SeqCst)
}

/// Next update for `job_id` on a stream, skipping other jobs.
pub async fn next_update_for(
    stream: &mut broadcast::Receiver<ProcessingUpdate>,
    job_id: &str,
) -> ProcessingUpdate {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let update = stream.recv().await.expect("notifier stream closed");
            if update.job_id == job_id {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for job update")
}

pub async fn wait_for_status(store: &SessionStore, session_id: &str, status: SessionStatus) -> Session {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let session = store.get_session(session_id).await.expect("session lookup");
            if session.status == status {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for session status")
}
