pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod pipeline;
pub mod runtime;
pub mod settings;
pub mod store;
mod utils;

pub use error::{PipelineError, Result};
pub use ingest::SessionIngestor;
pub use jobs::{
    Job, JobHandler, JobOutcome, JobOutput, JobPayload, JobStatus, JobType, ProcessingNotifier,
    ProcessingUpdate, Scheduler, SchedulerStats,
};
pub use pipeline::{Collaborators, PipelineSummary, Stage, StageDriver};
pub use runtime::Runtime;
pub use settings::{PipelineSettings, SettingsStore};
pub use store::SessionStore;

/// Install the `env_logger` backend at `info`; per-module directives in
/// `RUST_LOG` still apply. Later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
