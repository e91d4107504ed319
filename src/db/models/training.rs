use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which output field of the training generator an example came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExampleShape {
    Examples,
    /// Older generators emitted chat-style `messages` instead of `examples`.
    Messages,
}

impl ExampleShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExampleShape::Examples => "examples",
            ExampleShape::Messages => "messages",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingExample {
    pub position: u32,
    pub shape: ExampleShape,
    pub payload: Value,
}
