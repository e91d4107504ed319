mod batcher;
mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;
mod throttle;

pub use batcher::{OperationBatcher, OperationKind};
pub use connection::Database;
pub use models::{
    CompletionRecord, ExampleShape, Interaction, InteractionKind, InteractionLogSnapshot,
    ProcessingStatus, QualityMetrics, Screenshot, Session, SessionStatus, TrainingExample,
};
pub use throttle::DbThrottle;
