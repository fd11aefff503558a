use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only progress log. `Status` is upserted on `(name, job_id)`;
/// each worker pass appends an [`StatusEvent`] under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub id: Uuid,
    /// Worker name that produced the status.
    pub name: String,
    pub job_id: Uuid,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Running,
    Success,
    Fail,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Running => "running",
            EventState::Success => "success",
            EventState::Fail => "fail",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub id: Uuid,
    pub status_id: Uuid,
    pub state: EventState,
    pub message: String,
    pub created_at: i64,
}
