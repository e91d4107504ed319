//! Process-wide wiring: one throttle, store, batcher, notifier, driver and
//! scheduler, built once and shared by handle.

use std::{path::Path, sync::Arc};

use anyhow::Context;

use crate::db::{Database, DbThrottle, OperationBatcher};
use crate::error::Result;
use crate::ingest::SessionIngestor;
use crate::jobs::{Job, JobPayload, ProcessingNotifier, Scheduler, SchedulerConfig, SchedulerStats};
use crate::pipeline::{Collaborators, DriverConfig, PipelineJobHandler, StageDriver};
use crate::settings::{PipelineSettings, SettingsStore};
use crate::store::{AppendPolicy, SessionStore};
use crate::{log_info, log_warn};

const ENABLE_LOGS: bool = true;

pub struct Runtime {
    settings: PipelineSettings,
    store: SessionStore,
    batcher: OperationBatcher,
    scheduler: Scheduler,
    ingestor: SessionIngestor,
}

impl Runtime {
    /// Open `sessionflow.sqlite3` and `settings.json` under `data_dir`,
    /// creating the directory if needed, then start.
    pub async fn open(data_dir: &Path, collaborators: Collaborators) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let settings = SettingsStore::new(data_dir.join("settings.json"))?.settings();
        let database = Database::new(data_dir.join("sessionflow.sqlite3"))?;
        Self::start(settings, database, collaborators).await
    }

    /// Wire every component, re-queue sessions interrupted mid-pipeline and
    /// start the scheduler's tick loop.
    pub async fn start(
        settings: PipelineSettings,
        database: Database,
        collaborators: Collaborators,
    ) -> Result<Self> {
        settings.validate()?;

        let throttle = Arc::new(DbThrottle::new(settings.db_max_concurrent_operations));
        let store = SessionStore::new(database, throttle, AppendPolicy::from_settings(&settings));
        let batcher = OperationBatcher::new(settings.batch_max_size, settings.batch_window());
        let notifier = ProcessingNotifier::new();

        let driver = Arc::new(StageDriver::new(
            store.clone(),
            collaborators,
            DriverConfig::from_settings(&settings),
        ));
        let handler = Arc::new(PipelineJobHandler::new(store.clone(), driver));
        let scheduler = Scheduler::new(SchedulerConfig::from_settings(&settings), handler, notifier);
        let ingestor = SessionIngestor::new(
            store.clone(),
            batcher.clone(),
            scheduler.clone(),
            settings.max_retries,
        );

        let runtime = Self {
            settings,
            store,
            batcher,
            scheduler,
            ingestor,
        };
        runtime.recover().await?;
        runtime.scheduler.start();
        Ok(runtime)
    }

    async fn recover(&self) -> Result<()> {
        let stuck = self.store.sessions_awaiting_pipeline().await?;
        if stuck.is_empty() {
            return Ok(());
        }

        log_warn!(
            "re-queueing {} session(s) interrupted mid-pipeline",
            stuck.len()
        );
        for session_id in stuck {
            let job_id = self.scheduler.submit(
                Job::new(session_id.as_str(), JobPayload::SessionComplete)
                    .with_max_retries(self.settings.max_retries),
            );
            log_info!("recovered session {} as job {}", session_id, job_id);
        }
        Ok(())
    }

    pub fn ingestor(&self) -> &SessionIngestor {
        &self.ingestor
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn notifier(&self) -> &ProcessingNotifier {
        self.scheduler.notifier()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Release any partially filled batch, then stop the tick loop and
    /// pending retries. Running handlers finish on their own.
    pub async fn shutdown(&self) {
        self.batcher.flush();
        self.scheduler.shutdown().await;
        log_info!("runtime shut down");
    }
}
