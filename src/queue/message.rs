use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::now_ns;

/// One unit of queued work: an opaque `jid` plus JSON `args`.
/// Pipeline stages use a JSON array under `args`; the direct dispatcher
/// uses a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub jid: String,
    pub queue: String,
    pub args: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub enqueued_at: i64,
}

impl Message {
    pub fn new(queue: &str, args: Value) -> Message {
        Message {
            jid: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            args,
            retry_count: 0,
            enqueued_at: now_ns(),
        }
    }

    /// The args as an array, for array-payload queues.
    pub fn args_array(&self) -> Result<&Vec<Value>> {
        self.args
            .as_array()
            .ok_or_else(|| DispatchError::Queue("message args must be a JSON array".to_string()))
    }

    /// First arg as a string, the common `[jobId]` shape.
    pub fn arg_str(&self, index: usize) -> Result<&str> {
        self.args_array()?
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DispatchError::Queue(format!("message arg {} missing or not a string", index))
            })
    }
}
