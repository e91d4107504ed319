use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Click,
    Input,
    Scroll,
    Navigation,
    FormSubmit,
}

/// One recorded user action, embedded in its session's interaction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Client-side sequence number within the recording.
    pub sequence: u64,
    pub kind: InteractionKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Interaction {
    pub fn new(sequence: u64, kind: InteractionKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            kind,
            timestamp,
            target: None,
            value: None,
            url: None,
        }
    }

    /// Page changes and form submissions mark a meaningful step in the
    /// recording and trigger an interim quality check.
    pub fn is_high_value(&self) -> bool {
        matches!(
            self.kind,
            InteractionKind::Navigation | InteractionKind::FormSubmit
        )
    }
}
