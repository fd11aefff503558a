// Stage 5: the fast path. For filter-only jobs with no CSV artifact, scan
// one `seq_id` interval of the user table and render/publish in one pass.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::filter::Filters;
use crate::model::{now_ns, EventState};
use crate::queue::{Message, Worker};
use crate::worker::dispatch::{
    advance_progress, apply_circuit_breaker, build_template_index, publish_batch, Recipient,
};
use crate::worker::{mark_job_running, WorkerContext, DIRECT_QUEUE};

const WORKER_NAME: &str = "direct_worker";

/// One block of the tiled `seq_id` range: `smallest` is outside the
/// interval, `biggest` inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectPartMsg {
    #[serde(rename = "smallestSeqID")]
    pub smallest_seq_id: i64,
    #[serde(rename = "biggestSeqID")]
    pub biggest_seq_id: i64,
    #[serde(rename = "jobUUID")]
    pub job_uuid: Uuid,
}

pub struct DirectWorker {
    ctx: Arc<WorkerContext>,
}

impl DirectWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Worker for DirectWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        DIRECT_QUEUE
    }

    async fn process(&self, message: Message) -> Result<()> {
        let part: DirectPartMsg = serde_json::from_value(message.args.clone())?;
        let info = self.ctx.store.get_job_info(part.job_uuid).await?;
        self.ctx
            .store
            .tag_job(part.job_uuid, WORKER_NAME, EventState::Running, "starting")
            .await?;
        info!(job_id = %part.job_uuid, "starting");

        if info.job.is_expired(now_ns()) {
            info!(job_id = %part.job_uuid, "job expired, dropping part");
            return Ok(());
        }
        if info.job.status.halts_work() {
            info!(job_id = %part.job_uuid, status = %info.job.status, "job halted, returning");
            return Ok(());
        }
        mark_job_running(&self.ctx.store, &info.job).await?;

        let names = info.template_names();
        let templates = self
            .ctx
            .store
            .templates_by_names(info.group.app_id, &names)
            .await?;
        let index = build_template_index(templates);
        if index.is_empty() {
            self.ctx
                .store
                .tag_job(
                    part.job_uuid,
                    WORKER_NAME,
                    EventState::Fail,
                    &format!(
                        "no templates were found with name {}",
                        info.group.template_name
                    ),
                )
                .await?;
            return Ok(());
        }

        let table = info.push_db_table();
        let filters = Filters::from_map(&info.job.filters)?;
        let users = self
            .ctx
            .push_db
            .users_in_seq_range(&table, &filters, part.smallest_seq_id, part.biggest_seq_id)
            .await?;
        let recipients: Vec<Recipient> = users.into_iter().map(Recipient::from).collect();
        let topic = self.ctx.topic_name(&info.app.name, info.job.service);

        let stats = match publish_batch(&self.ctx, &info, &index, &topic, &recipients).await {
            Ok(stats) => stats,
            Err(DispatchError::Data(reason)) => {
                self.ctx
                    .store
                    .tag_job(part.job_uuid, WORKER_NAME, EventState::Fail, &reason)
                    .await?;
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        advance_progress(&self.ctx, part.job_uuid, stats.published).await?;
        if apply_circuit_breaker(&self.ctx, WORKER_NAME, &info, &stats).await? {
            return Ok(());
        }

        self.ctx
            .store
            .tag_job(part.job_uuid, WORKER_NAME, EventState::Success, "finished")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_message_wire_names() {
        let id = Uuid::new_v4();
        let wire = json!({
            "smallestSeqID": 0,
            "biggestSeqID": 500,
            "jobUUID": id.to_string(),
        });
        let part: DirectPartMsg = serde_json::from_value(wire).unwrap();
        assert_eq!(part.smallest_seq_id, 0);
        assert_eq!(part.biggest_seq_id, 500);
        assert_eq!(part.job_uuid, id);

        let back = serde_json::to_value(&part).unwrap();
        assert!(back.get("smallestSeqID").is_some());
        assert!(back.get("jobUUID").is_some());
    }
}
