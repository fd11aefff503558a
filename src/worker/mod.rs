//! The pipeline stages.
//!
//! Each worker pulls from one named queue and enqueues work for the next
//! stage. All cross-worker state lives in the stores; a worker keeps no
//! per-job state beyond the lifetime of a single message.

mod csv_split;
mod db_to_csv;
mod direct;
mod dispatch;
mod expander;
mod from_filters;
mod process_batch;

pub use csv_split::CsvSplitWorker;
pub use db_to_csv::{DbToCsvMessage, DbToCsvWorker, PageQuery};
pub use direct::{DirectPartMsg, DirectWorker};
pub use expander::JobGroupExpanderWorker;
pub use from_filters::CreateBatchesFromFiltersWorker;
pub use process_batch::{BatchUser, ProcessBatchWorker};

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::model::{Job, JobStatus, Service};
use crate::queue::Broker;
use crate::storage::{JobStore, ObjectStorage, PushBus, PushDb};

pub const JOB_GROUP_EXPANDER_QUEUE: &str = "job_group_expander_worker";
pub const CREATE_BATCHES_FROM_FILTERS_QUEUE: &str = "create_batches_using_filters_worker";
pub const DB_TO_CSV_QUEUE: &str = "db_to_csv_worker";
pub const CSV_SPLIT_QUEUE: &str = "csv_split_worker";
pub const PROCESS_BATCH_QUEUE: &str = "process_batch_worker";
pub const DIRECT_QUEUE: &str = "direct_worker";

/// On-wire bytes of one UUID user id with its trailing newline, the unit
/// of the multipart page-size arithmetic.
pub const UUID_CSV_BYTES: u64 = 37;

/// Shared dependencies handed to every worker.
pub struct WorkerContext {
    pub config: Config,
    pub broker: Arc<Broker>,
    pub store: Arc<dyn JobStore>,
    pub push_db: Arc<dyn PushDb>,
    pub objects: Arc<dyn ObjectStorage>,
    pub bus: Arc<dyn PushBus>,
}

impl WorkerContext {
    /// The assembled audience CSV for a job.
    pub fn csv_object_key(&self, job_id: Uuid) -> String {
        format!("{}/job-{}.csv", self.config.s3.folder, job_id)
    }

    /// The held-out control group CSV for a job.
    pub fn control_group_object_key(&self, job_id: Uuid) -> String {
        format!("{}/job-{}-control-group.csv", self.config.s3.folder, job_id)
    }

    /// Outbound topic, expanded from the configured format.
    pub fn topic_name(&self, app_name: &str, service: Service) -> String {
        self.config
            .workers
            .topic_template
            .replace("{app}", app_name)
            .replace("{service}", service.as_str())
    }
}

/// Deterministic control-group membership: a hash of `(user_id, job_id)`
/// against the configured fraction. Re-delivered batches classify every
/// user the same way, so the held-out set never shifts under retries.
pub fn control_group_member(user_id: Uuid, job_id: Uuid, fraction: f64) -> bool {
    if fraction <= 0.0 {
        return false;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(user_id.as_bytes());
    hasher.update(job_id.as_bytes());
    let hash = hasher.finalize();
    (hash as f64) / (u32::MAX as f64 + 1.0) < fraction
}

/// First-pickup transition: a scheduled job a worker just claimed becomes
/// running.
pub(crate) async fn mark_job_running(store: &Arc<dyn JobStore>, job: &Job) -> Result<()> {
    if job.status == JobStatus::Scheduled {
        store.set_job_status(job.id, JobStatus::Running).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_group_membership_is_deterministic() {
        let job_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let first = control_group_member(user_id, job_id, 0.5);
        for _ in 0..10 {
            assert_eq!(control_group_member(user_id, job_id, 0.5), first);
        }
    }

    #[test]
    fn test_control_group_fraction_zero_excludes_everyone() {
        let job_id = Uuid::new_v4();
        for _ in 0..100 {
            assert!(!control_group_member(Uuid::new_v4(), job_id, 0.0));
        }
    }

    #[test]
    fn test_control_group_fraction_tracks_ratio() {
        let job_id = Uuid::new_v4();
        let total = 20_000;
        let held_out = (0..total)
            .filter(|_| control_group_member(Uuid::new_v4(), job_id, 0.2))
            .count();
        let ratio = held_out as f64 / total as f64;
        // binomial bounds, ~6 sigma for p = 0.2 at n = 20k
        assert!(ratio > 0.18 && ratio < 0.22, "ratio was {}", ratio);
    }

    #[test]
    fn test_uuid_csv_bytes_matches_a_real_id() {
        let line = format!("{}\n", Uuid::new_v4());
        assert_eq!(line.len() as u64, UUID_CSV_BYTES);
    }
}
