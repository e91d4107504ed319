pub mod interaction;
pub mod screenshot;
pub mod session;
pub mod training;

pub use interaction::{Interaction, InteractionKind};
pub use screenshot::Screenshot;
pub use session::{
    CompletionRecord, InteractionLogSnapshot, ProcessingStatus, QualityMetrics, Session,
    SessionStatus,
};
pub use training::{ExampleShape, TrainingExample};
