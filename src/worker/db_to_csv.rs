// Stage 2b: run one page query and upload the result as one multipart
// part. The worker that lands the last acknowledged part (a shared broker
// counter keyed on job id) completes the upload and hands off to the
// splitter; part order on the wire does not matter.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::filter::Filters;
use crate::model::EventState;
use crate::queue::{Message, Worker};
use crate::worker::{WorkerContext, CSV_SPLIT_QUEUE, DB_TO_CSV_QUEUE};

const WORKER_NAME: &str = "db_to_csv_worker";

/// One page of the audience scan, fully described so the page worker can
/// re-run it idempotently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub table: String,
    /// Ids strictly greater than this seed belong to the page.
    pub smallest_id: Uuid,
    pub page_size: i64,
    pub filters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbToCsvMessage {
    pub query: PageQuery,
    /// Multipart part number, starting at 1.
    pub part_number: i32,
    /// The multipart upload id.
    pub uploader: String,
    /// Total page tasks for this job.
    pub total_jobs: i64,
    pub job: Uuid,
}

pub struct DbToCsvWorker {
    ctx: Arc<WorkerContext>,
}

impl DbToCsvWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Worker for DbToCsvWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        DB_TO_CSV_QUEUE
    }

    async fn process(&self, message: Message) -> Result<()> {
        let payload = message
            .args_array()?
            .first()
            .cloned()
            .ok_or_else(|| DispatchError::Queue("empty db_to_csv message".to_string()))?;
        let task: DbToCsvMessage = serde_json::from_value(payload)?;

        let filters = Filters::from_map(&task.query.filters)?;
        let ids = self
            .ctx
            .push_db
            .user_ids_after(
                &task.query.table,
                &filters,
                task.query.smallest_id,
                task.query.page_size,
            )
            .await?;

        // Parts assemble in part order, so the header travels with part 1.
        let mut part = String::with_capacity(ids.len() * 37 + 8);
        if task.part_number == 1 {
            part.push_str("userIds\n");
        }
        for id in &ids {
            part.push_str(&id.to_string());
            part.push('\n');
        }

        let csv_key = self.ctx.csv_object_key(task.job);
        self.ctx
            .objects
            .upload_part(&csv_key, &task.uploader, task.part_number, Bytes::from(part))
            .await?;
        debug!(job_id = %task.job, part = task.part_number, ids = ids.len(), "part uploaded");

        let counter_key = format!("db_to_csv:{}", task.job);
        let acknowledged = self.ctx.broker.incr_counter(&counter_key);
        if acknowledged >= task.total_jobs as u64 {
            self.ctx
                .objects
                .complete_multipart_upload(&csv_key, &task.uploader)
                .await?;
            self.ctx.broker.remove_counter(&counter_key);
            self.ctx
                .broker
                .enqueue(CSV_SPLIT_QUEUE, json!([task.job.to_string()]));
            self.ctx
                .store
                .tag_job(task.job, WORKER_NAME, EventState::Success, "csv assembled")
                .await?;
            info!(job_id = %task.job, parts = task.total_jobs, "csv assembled");
        }
        Ok(())
    }
}
