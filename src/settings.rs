use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for the scheduler, the database gate and the stage driver.
///
/// Durations are stored as milliseconds so the JSON file stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_concurrent_jobs: usize,
    pub tick_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_unit_ms: u64,
    /// Connection ceiling of the backing store; the throttle must stay below it.
    pub db_pool_size: usize,
    pub db_max_concurrent_operations: usize,
    pub batch_max_size: usize,
    pub batch_window_ms: u64,
    pub append_max_attempts: u32,
    pub append_retry_min_delay_ms: u64,
    pub append_retry_max_delay_ms: u64,
    pub validation_score_floor: f64,
    pub stage_timeout_ms: u64,
    pub archive_enabled: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            tick_interval_ms: 500,
            max_retries: 3,
            backoff_unit_ms: 1_000,
            db_pool_size: 10,
            db_max_concurrent_operations: 8,
            batch_max_size: 5,
            batch_window_ms: 2_000,
            append_max_attempts: 3,
            append_retry_min_delay_ms: 10,
            append_retry_max_delay_ms: 50,
            validation_score_floor: 40.0,
            stage_timeout_ms: 120_000,
            archive_enabled: true,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be greater than zero");
        }
        if self.db_max_concurrent_operations == 0 {
            bail!("db_max_concurrent_operations must be greater than zero");
        }
        if self.db_max_concurrent_operations >= self.db_pool_size {
            bail!(
                "db_max_concurrent_operations ({}) must stay below db_pool_size ({})",
                self.db_max_concurrent_operations,
                self.db_pool_size
            );
        }
        if self.batch_max_size == 0 {
            bail!("batch_max_size must be greater than zero");
        }
        if self.append_max_attempts == 0 {
            bail!("append_max_attempts must be greater than zero");
        }
        if self.append_retry_min_delay_ms > self.append_retry_max_delay_ms {
            bail!(
                "append retry delay range is inverted ({}ms > {}ms)",
                self.append_retry_min_delay_ms,
                self.append_retry_max_delay_ms
            );
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PipelineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    log::warn!(
                        "Ignoring malformed settings at {}: {err}",
                        path.display()
                    );
                    PipelineSettings::default()
                }
            }
        } else {
            PipelineSettings::default()
        };

        data.validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn settings(&self) -> PipelineSettings {
        self.read().clone()
    }

    pub fn update(&self, settings: PipelineSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.write();
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, PipelineSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PipelineSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
