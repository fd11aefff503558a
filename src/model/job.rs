use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{now_ns, App, JobGroup};

/// Target push platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Apns,
    Gcm,
}

impl Service {
    pub const ALL: [Service; 2] = [Service::Apns, Service::Gcm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Apns => "apns",
            Service::Gcm => "gcm",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Service> {
        match s {
            "apns" => Ok(Service::Apns),
            "gcm" => Ok(Service::Gcm),
            _ => Err(DispatchError::invalid_field("service")),
        }
    }
}

/// Job lifecycle.
///
/// ```text
/// created -> scheduled -> running -> {completed | stopped | circuitbreak | paused}
///                            ^                                     |
///                            +------------- resume ----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Scheduled,
    Running,
    Paused,
    Stopped,
    CircuitBreak,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::CircuitBreak => "circuitbreak",
            JobStatus::Completed => "completed",
        }
    }

    /// Whether a worker observing this status must return without enqueuing
    /// follow-up work or publishing.
    pub fn halts_work(&self) -> bool {
        matches!(
            self,
            JobStatus::Paused | JobStatus::Stopped | JobStatus::CircuitBreak
        )
    }

    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Created, Scheduled)
                | (Scheduled, Running)
                | (Running, Completed)
                | (Running, Stopped)
                | (Running, CircuitBreak)
                | (Running, Paused)
                | (Paused, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<JobStatus> {
        match s {
            "created" => Ok(JobStatus::Created),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "stopped" => Ok(JobStatus::Stopped),
            "circuitbreak" => Ok(JobStatus::CircuitBreak),
            "completed" => Ok(JobStatus::Completed),
            _ => Err(DispatchError::invalid_field("status")),
        }
    }
}

/// A single-platform unit of work with its own audience and progress.
/// Created by the expander; counters are advanced only through storage-side
/// arithmetic while a worker holds the queue message referencing the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub job_group_id: Uuid,
    pub service: Service,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub csv_path: String,
    #[serde(default)]
    pub control_group_csv_path: String,
    #[serde(default)]
    pub db_page_size: i64,
    #[serde(default)]
    pub total_batches: i64,
    #[serde(default)]
    pub completed_batches: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub completed_tokens: i64,
    #[serde(default)]
    pub total_users: i64,
    #[serde(default)]
    pub starts_at: i64,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub completed_at: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub feedbacks: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Job {
    /// A job freshly fanned out of `group` for one platform.
    pub fn from_group(group: &JobGroup, service: Service) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_group_id: group.id,
            service,
            filters: group.filters.clone(),
            csv_path: group.csv_path.clone(),
            control_group_csv_path: String::new(),
            db_page_size: 0,
            total_batches: 0,
            completed_batches: 0,
            total_tokens: 0,
            completed_tokens: 0,
            total_users: 0,
            starts_at: group.starts_at,
            expires_at: group.expires_at,
            completed_at: 0,
            status: JobStatus::Created,
            feedbacks: serde_json::Map::new(),
            created_at: now_ns(),
            updated_at: 0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at > 0 && now > self.expires_at
    }

    /// Deadline in whole seconds for the outbound bus (stored as nanoseconds).
    pub fn push_expiry_seconds(&self) -> i64 {
        self.expires_at / 1_000_000_000
    }
}

/// A job hydrated with its group and app, the unit every worker operates on.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job: Job,
    pub group: JobGroup,
    pub app: App,
}

impl JobInfo {
    pub fn push_db_table(&self) -> String {
        self.app.push_db_table(self.job.service)
    }

    pub fn template_names(&self) -> Vec<String> {
        self.group.template_names()
    }
}
