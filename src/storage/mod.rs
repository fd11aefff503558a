//! Storage ports and their drivers.
//!
//! Four seams, each an `Arc<dyn Trait>` handed to the workers:
//!
//! - [`JobStore`] — the relational store holding apps, templates, job groups,
//!   jobs and the status/event progress log. Counters move only through
//!   storage-side arithmetic; completion is a conditional write.
//! - [`PushDb`] — the read-only per-app platform user tables.
//! - [`ObjectStorage`] — the CSV artifacts, written through multipart
//!   uploads keyed by job id.
//! - [`PushBus`] — the outbound bus the platform gateways consume from.
//!
//! `memory` backs tests and local runs; `postgres`, `s3` and (feature
//! `kafka`) `kafka` are the production drivers.

pub mod memory;
pub mod postgres;
pub mod s3;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::{LogPushBus, MemoryJobStore, MemoryObjectStorage, MemoryPushBus, MemoryPushDb};
pub use postgres::{PgJobStore, PgPushDb};
pub use s3::S3ObjectStorage;

#[cfg(feature = "kafka")]
pub use kafka::KafkaPushBus;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::Filters;
use crate::model::{App, EventState, Job, JobGroup, JobInfo, JobStatus, Status, StatusEvent, Template};

/// One row of a platform user table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PushUser {
    pub user_id: Uuid,
    pub token: String,
    pub locale: String,
    #[serde(default)]
    pub tz: String,
    #[serde(default)]
    pub seq_id: i64,
    /// Additional filterable columns beyond the fixed schema.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl PushUser {
    /// Column lookup used by the in-memory filter evaluator.
    pub fn attr(&self, column: &str) -> Option<&str> {
        match column {
            "user_id" => None,
            "token" => Some(&self.token),
            "locale" => Some(&self.locale),
            "tz" => Some(&self.tz),
            other => self.attrs.get(other).map(String::as_str),
        }
    }
}

/// A push record accepted by the bus, as the gateways will see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPush {
    pub service: crate::model::Service,
    pub topic: String,
    pub device_token: String,
    pub body: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub push_metadata: Map<String, Value>,
    pub push_expiry: i64,
    pub template_name: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_app(&self, app: &App) -> Result<()>;
    async fn get_app(&self, id: Uuid) -> Result<App>;

    async fn create_template(&self, template: &Template) -> Result<()>;
    /// Templates for `app_id` whose name is in `names` (the split
    /// comma-list), across all locales.
    async fn templates_by_names(&self, app_id: Uuid, names: &[String]) -> Result<Vec<Template>>;

    async fn create_job_group(&self, group: &JobGroup) -> Result<()>;
    async fn get_job_group(&self, id: Uuid) -> Result<JobGroup>;

    async fn create_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Job>;
    async fn jobs_by_group(&self, group_id: Uuid) -> Result<Vec<Job>>;
    /// The job hydrated with its group and app.
    async fn get_job_info(&self, id: Uuid) -> Result<JobInfo>;

    async fn update_job_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()>;
    async fn update_control_group_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()>;
    async fn set_job_db_page_size(&self, job_id: Uuid, db_page_size: i64) -> Result<()>;
    async fn set_job_totals(
        &self,
        job_id: Uuid,
        total_batches: i64,
        total_users: i64,
        total_tokens: i64,
    ) -> Result<()>;
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Storage-side `completed_batches = completed_batches + n`, returning
    /// the updated job.
    async fn add_completed_batches(&self, job_id: Uuid, n: i64) -> Result<Job>;
    /// Storage-side `completed_tokens = completed_tokens + n`.
    async fn add_completed_tokens(&self, job_id: Uuid, n: i64) -> Result<()>;
    /// Conditionally set `completed_at` (and the completed status) when all
    /// batches are in and it is still unset. At most one caller wins;
    /// returns whether this one did.
    async fn try_complete_job(&self, job_id: Uuid, now_ns: i64) -> Result<bool>;

    /// Upsert the `(name, job_id)` status row and append an event under it.
    async fn tag_job(
        &self,
        job_id: Uuid,
        name: &str,
        state: EventState,
        message: &str,
    ) -> Result<()>;
    async fn job_events(&self, job_id: Uuid) -> Result<Vec<(Status, Vec<StatusEvent>)>>;
}

#[async_trait]
pub trait PushDb: Send + Sync {
    /// `count(DISTINCT user_id)` under the filter clause.
    async fn count_distinct_users(&self, table: &str, filters: &Filters) -> Result<i64>;

    /// Seed ids for `page_count` pages of `page_size` distinct user ids in
    /// user-id order. Page 1 seeds from the all-zero UUID; later seeds come
    /// from a server-side cursor advanced `page_size` rows at a time.
    async fn page_seeds(
        &self,
        table: &str,
        filters: &Filters,
        page_size: i64,
        page_count: i64,
    ) -> Result<Vec<Uuid>>;

    /// One page: distinct user ids strictly after `after`, in order,
    /// limited to `limit`.
    async fn user_ids_after(
        &self,
        table: &str,
        filters: &Filters,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    /// Join a batch of user ids against the table for tokens and locales.
    async fn users_by_ids(&self, table: &str, ids: &[Uuid]) -> Result<Vec<PushUser>>;

    /// Rows with `seq_id > smallest AND seq_id <= biggest` under the filter.
    async fn users_in_seq_range(
        &self,
        table: &str,
        filters: &Filters,
        smallest: i64,
        biggest: i64,
    ) -> Result<Vec<PushUser>>;

    /// `(min, max)` of `seq_id` under the filter; `None` when no rows match.
    async fn seq_bounds(&self, table: &str, filters: &Filters) -> Result<Option<(i64, i64)>>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    /// Begin a multipart upload; returns the upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;
    /// Upload one part. Parts are numbered from 1 and idempotent per
    /// `(upload_id, part_number)`.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<()>;
    /// Assemble all uploaded parts, in part order, into the object.
    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

#[async_trait]
pub trait PushBus: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn send_apns_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn send_gcm_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()>;
}
