//! Data model: apps, templates, job groups, jobs and their progress log.
//!
//! Timestamps are epoch nanoseconds throughout (`0` meaning unset), matching
//! the storage layer. Admission validation lives on the model types; workers
//! never see an invalid job group.

mod app;
mod job;
mod job_group;
mod status;
mod template;

pub use app::App;
pub use job::{Job, JobInfo, JobStatus, Service};
pub use job_group::{AudienceSource, JobGroup};
pub use status::{EventState, Status, StatusEvent};
pub use template::Template;

use chrono::Utc;

/// Current time as epoch nanoseconds.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
