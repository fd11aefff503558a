// Stage 1: fan a job group out into one job per platform and schedule the
// audience stage at the group's start time.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::filter::Filters;
use crate::model::{AudienceSource, EventState, Job, JobGroup, JobStatus, Service};
use crate::queue::{Message, Worker};
use crate::worker::{
    WorkerContext, CREATE_BATCHES_FROM_FILTERS_QUEUE, CSV_SPLIT_QUEUE, DIRECT_QUEUE,
    JOB_GROUP_EXPANDER_QUEUE,
};

const WORKER_NAME: &str = "job_group_expander_worker";

pub struct JobGroupExpanderWorker {
    ctx: Arc<WorkerContext>,
}

impl JobGroupExpanderWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    async fn expand_for_service(&self, group: &JobGroup, service: Service) -> Result<()> {
        let app = self.ctx.store.get_app(group.app_id).await?;
        let mut job = Job::from_group(group, service);
        job.status = JobStatus::Scheduled;
        self.ctx.store.create_job(&job).await?;
        self.ctx
            .store
            .tag_job(job.id, WORKER_NAME, EventState::Success, "job created")
            .await?;

        match group.audience_source() {
            AudienceSource::Csv(_) => {
                self.ctx.broker.enqueue_at(
                    CSV_SPLIT_QUEUE,
                    job.starts_at,
                    json!([job.id.to_string()]),
                );
                Ok(())
            }
            AudienceSource::Direct => {
                self.assign_direct_parts(&job, &app.push_db_table(service))
                    .await
            }
            AudienceSource::Filters => {
                self.ctx.broker.enqueue_at(
                    CREATE_BATCHES_FROM_FILTERS_QUEUE,
                    job.starts_at,
                    json!([job.id.to_string()]),
                );
                Ok(())
            }
        }
    }

    /// Tile the table's `seq_id` range into intervals of roughly equal
    /// cardinality and enqueue one direct part per interval.
    async fn assign_direct_parts(&self, job: &Job, table: &str) -> Result<()> {
        let filters = Filters::from_map(&job.filters)?;
        let count = self
            .ctx
            .push_db
            .count_distinct_users(table, &filters)
            .await?;
        if count == 0 {
            self.ctx
                .store
                .tag_job(
                    job.id,
                    WORKER_NAME,
                    EventState::Fail,
                    "no users matching the filters",
                )
                .await?;
            return Ok(());
        }
        let (min_seq, max_seq) = match self.ctx.push_db.seq_bounds(table, &filters).await? {
            Some(bounds) => bounds,
            None => return Ok(()),
        };

        let batch_size = self.ctx.config.workers.batch_size as i64;
        let parts = (count + batch_size - 1) / batch_size;
        // half-open (a, b] intervals starting just below the smallest seq
        let base = min_seq - 1;
        let span = max_seq - base;
        let width = (span + parts - 1) / parts;

        self.ctx
            .store
            .set_job_totals(job.id, parts, count, 0)
            .await?;

        for part in 0..parts {
            let smallest = base + part * width;
            let biggest = (smallest + width).min(max_seq);
            self.ctx.broker.enqueue_at(
                DIRECT_QUEUE,
                job.starts_at,
                json!({
                    "smallestSeqID": smallest,
                    "biggestSeqID": biggest,
                    "jobUUID": job.id.to_string(),
                }),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for JobGroupExpanderWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        JOB_GROUP_EXPANDER_QUEUE
    }

    async fn process(&self, message: Message) -> Result<()> {
        let group_id: Uuid = message
            .arg_str(0)?
            .parse()
            .map_err(|_| crate::error::DispatchError::invalid_field("jobGroupId"))?;
        let group = self.ctx.store.get_job_group(group_id).await?;
        info!(group_id = %group_id, "expanding job group");

        for service in Service::ALL {
            self.expand_for_service(&group, service).await?;
        }
        Ok(())
    }
}
