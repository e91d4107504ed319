mod model;
mod notifier;
mod queue;
mod scheduler;

pub use model::{Job, JobOutput, JobPayload, JobStatus, JobType};
pub use notifier::{JobOutcome, ProcessingNotifier, ProcessingUpdate};
pub use queue::JobQueue;
pub use scheduler::{JobHandler, Scheduler, SchedulerConfig, SchedulerStats};
