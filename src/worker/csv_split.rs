// Stage 3: stream the assembled CSV, carve off the deterministic control
// group, and enqueue one batch message per fixed-size chunk of the
// remaining ids.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{now_ns, EventState};
use crate::queue::{Message, Worker};
use crate::worker::{
    control_group_member, mark_job_running, WorkerContext, CSV_SPLIT_QUEUE, PROCESS_BATCH_QUEUE,
};

const WORKER_NAME: &str = "csv_split_worker";
const CSV_HEADER: &str = "userIds";

pub struct CsvSplitWorker {
    ctx: Arc<WorkerContext>,
}

impl CsvSplitWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Parse the id column: header skipped, blanks skipped, duplicates
    /// collapsed keeping first occurrence. Operator-supplied CSVs may carry
    /// junk lines; those are logged and skipped rather than failing the job.
    fn parse_ids(&self, job_id: Uuid, body: &[u8]) -> Vec<Uuid> {
        let text = String::from_utf8_lossy(body);
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || (line_number == 0 && line == CSV_HEADER) {
                continue;
            }
            match line.parse::<Uuid>() {
                Ok(id) => {
                    if seen.insert(id) {
                        ids.push(id);
                    }
                }
                Err(_) => {
                    warn!(job_id = %job_id, line_number, "skipping unparseable csv line");
                }
            }
        }
        ids
    }
}

#[async_trait]
impl Worker for CsvSplitWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        CSV_SPLIT_QUEUE
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

        if info.job.status.halts_work() {
            info!(job_id = %job_id, status = %info.job.status, "job halted, returning");
            return Ok(());
        }
        mark_job_running(&self.ctx.store, &info.job).await?;

        let csv_path = if info.job.csv_path.is_empty() {
            self.ctx.csv_object_key(job_id)
        } else {
            info.job.csv_path.clone()
        };
        let body = self.ctx.objects.get_object(&csv_path).await?;
        let all_ids = self.parse_ids(job_id, &body);

        let control_group = info.group.control_group;
        let mut dispatch = Vec::with_capacity(all_ids.len());
        let mut control = Vec::new();
        for id in all_ids {
            if control_group_member(id, job_id, control_group) {
                control.push(id);
            } else {
                dispatch.push(id);
            }
        }

        if !control.is_empty() {
            let mut control_csv = String::with_capacity(control.len() * 37 + 8);
            control_csv.push_str(CSV_HEADER);
            control_csv.push('\n');
            for id in &control {
                control_csv.push_str(&id.to_string());
                control_csv.push('\n');
            }
            let control_key = self.ctx.control_group_object_key(job_id);
            self.ctx
                .objects
                .put_object(&control_key, Bytes::from(control_csv))
                .await?;
            self.ctx
                .store
                .update_control_group_csv_path(job_id, &control_key)
                .await?;
        }

        let batch_size = self.ctx.config.workers.batch_size.max(1);
        let total_batches = dispatch.len().div_ceil(batch_size) as i64;
        let total_users = (dispatch.len() + control.len()) as i64;
        self.ctx
            .store
            .set_job_totals(job_id, total_batches, total_users, 0)
            .await?;

        if total_batches == 0 {
            self.ctx.store.try_complete_job(job_id, now_ns()).await?;
            self.ctx
                .store
                .tag_job(job_id, WORKER_NAME, EventState::Success, "empty audience")
                .await?;
            return Ok(());
        }

        for chunk in dispatch.chunks(batch_size) {
            let users: Vec<String> = chunk.iter().map(Uuid::to_string).collect();
            self.ctx.broker.enqueue(
                PROCESS_BATCH_QUEUE,
                json!([job_id.to_string(), info.app.name, users]),
            );
        }

        info!(
            job_id = %job_id,
            batches = total_batches,
            users = total_users,
            held_out = control.len(),
            "finished"
        );
        self.ctx
            .store
            .tag_job(job_id, WORKER_NAME, EventState::Success, "finished")
            .await?;
        Ok(())
    }
}
