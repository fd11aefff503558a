// Stage 2a (FromFilters): turn a job's filter map into a deduplicated,
// chunked list of user ids headed for object storage.
//
// The distinct-id count fixes the page arithmetic; a server-side cursor
// walk collects one seed id per page, so every page worker can run an
// indexed `user_id > seed ... LIMIT page_size` scan with no OFFSET cost
// and upload its part independently.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::filter::Filters;
use crate::model::{EventState, JobStatus};
use crate::queue::{Message, Worker};
use crate::worker::db_to_csv::{DbToCsvMessage, PageQuery};
use crate::worker::{
    mark_job_running, WorkerContext, CREATE_BATCHES_FROM_FILTERS_QUEUE, DB_TO_CSV_QUEUE,
    UUID_CSV_BYTES,
};

const WORKER_NAME: &str = "create_batches_using_filters_worker";

pub struct CreateBatchesFromFiltersWorker {
    ctx: Arc<WorkerContext>,
}

impl CreateBatchesFromFiltersWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Ids that fill one multipart part of the configured size.
    fn page_size(&self) -> i64 {
        let part_bytes = self.ctx.config.workers.effective_part_size_mb() * 1024 * 1024;
        ((part_bytes + UUID_CSV_BYTES - 1) / UUID_CSV_BYTES) as i64
    }
}

#[async_trait]
impl Worker for CreateBatchesFromFiltersWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        CREATE_BATCHES_FROM_FILTERS_QUEUE
    }

    async fn process(&self, message: Message) -> Result<()> {
        let job_id: Uuid = message
            .arg_str(0)?
            .parse()
            .map_err(|_| DispatchError::invalid_field("jobId"))?;
        let info = self.ctx.store.get_job_info(job_id).await?;
        self.ctx
            .store
            .tag_job(job_id, WORKER_NAME, EventState::Running, "starting")
            .await?;
        info!(job_id = %job_id, "starting");

        if info.job.status == JobStatus::Stopped {
            info!(job_id = %job_id, "stopped job");
            return Ok(());
        }
        mark_job_running(&self.ctx.store, &info.job).await?;

        let table = info.push_db_table();
        let filters = Filters::from_map(&info.job.filters)?;
        let count = self
            .ctx
            .push_db
            .count_distinct_users(&table, &filters)
            .await?;
        if count == 0 {
            self.ctx
                .store
                .tag_job(
                    job_id,
                    WORKER_NAME,
                    EventState::Fail,
                    "no users matching the filters",
                )
                .await?;
            return Ok(());
        }

        let page_size = self.page_size();
        let page_count = (count + page_size - 1) / page_size;
        let seeds = self
            .ctx
            .push_db
            .page_seeds(&table, &filters, page_size, page_count)
            .await?;

        let csv_key = self.ctx.csv_object_key(job_id);
        let upload_id = self.ctx.objects.create_multipart_upload(&csv_key).await?;
        self.ctx.store.update_job_csv_path(job_id, &csv_key).await?;
        self.ctx
            .store
            .set_job_db_page_size(job_id, page_size)
            .await?;

        for (index, seed) in seeds.iter().enumerate() {
            let task = DbToCsvMessage {
                query: PageQuery {
                    table: table.clone(),
                    smallest_id: *seed,
                    page_size,
                    filters: info.job.filters.clone(),
                },
                part_number: index as i32 + 1,
                uploader: upload_id.clone(),
                total_jobs: page_count,
                job: job_id,
            };
            self.ctx
                .broker
                .enqueue(DB_TO_CSV_QUEUE, json!([serde_json::to_value(&task)?]));
        }

        info!(job_id = %job_id, pages = page_count, users = count, "finished");
        self.ctx
            .store
            .tag_job(job_id, WORKER_NAME, EventState::Success, "finished")
            .await?;
        Ok(())
    }
}
