// Stage 4: join one batch of user ids against the platform user table,
// render a per-recipient message and publish it to the outbound bus, then
// advance the job's durable progress counters.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{now_ns, EventState, JobInfo};
use crate::queue::{Message, Worker};
use crate::worker::dispatch::{
    advance_progress, apply_circuit_breaker, build_template_index, publish_batch, Recipient,
};
use crate::worker::{mark_job_running, WorkerContext, PROCESS_BATCH_QUEUE};

const WORKER_NAME: &str = "process_batch_worker";

/// Batch messages carry either bare user ids (the splitter's shape, the
/// join happens here) or pre-joined users; both are legal on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchUser {
    Id(Uuid),
    User {
        user_id: Uuid,
        token: String,
        locale: String,
    },
}

#[derive(Debug)]
struct ParsedBatch {
    job_id: Uuid,
    #[allow(dead_code)]
    app_name: String,
    users: Vec<BatchUser>,
}

fn parse_batch_message(message: &Message) -> Result<ParsedBatch> {
    let args = message.args_array()?;
    if args.len() != 3 {
        return Err(DispatchError::Validation(
            "invalid message array".to_string(),
        ));
    }
    let job_id: Uuid = args[0]
        .as_str()
        .ok_or_else(|| DispatchError::Validation("invalid message array".to_string()))?
        .parse()
        .map_err(|_| DispatchError::invalid_field("jobId"))?;
    let app_name = args[1]
        .as_str()
        .ok_or_else(|| DispatchError::Validation("invalid message array".to_string()))?
        .to_string();
    let users: Vec<BatchUser> = serde_json::from_value(args[2].clone())
        .map_err(|_| DispatchError::Validation("invalid message array".to_string()))?;
    if users.is_empty() {
        return Err(DispatchError::Validation(
            "there must be at least one user".to_string(),
        ));
    }
    Ok(ParsedBatch {
        job_id,
        app_name,
        users,
    })
}

pub struct ProcessBatchWorker {
    ctx: Arc<WorkerContext>,
}

impl ProcessBatchWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Bare ids join against the user table for tokens and locales;
    /// pre-joined users pass through. A user may carry several tokens, each
    /// of which receives the push; ids with no row are dropped.
    async fn resolve_recipients(
        &self,
        info: &JobInfo,
        users: Vec<BatchUser>,
    ) -> Result<Vec<Recipient>> {
        let mut recipients = Vec::with_capacity(users.len());
        let mut bare_ids = Vec::new();
        for user in users {
            match user {
                BatchUser::Id(id) => bare_ids.push(id),
                BatchUser::User {
                    user_id,
                    token,
                    locale,
                } => recipients.push(Recipient {
                    user_id,
                    token,
                    locale,
                }),
            }
        }
        if !bare_ids.is_empty() {
            let table = info.push_db_table();
            let joined = self.ctx.push_db.users_by_ids(&table, &bare_ids).await?;
            recipients.extend(joined.into_iter().map(Recipient::from));
        }
        Ok(recipients)
    }
}

#[async_trait]
impl Worker for ProcessBatchWorker {
    fn name(&self) -> &'static str {
        WORKER_NAME
    }

    fn queue(&self) -> &'static str {
        PROCESS_BATCH_QUEUE
    }

    async fn process(&self, message: Message) -> Result<()> {
        let batch = parse_batch_message(&message)?;
        let info = self.ctx.store.get_job_info(batch.job_id).await?;
        self.ctx
            .store
            .tag_job(batch.job_id, WORKER_NAME, EventState::Running, "starting")
            .await?;

        if info.job.is_expired(now_ns()) {
            info!(job_id = %batch.job_id, "job expired, dropping batch");
            return Ok(());
        }
        if info.job.status.halts_work() {
            info!(job_id = %batch.job_id, status = %info.job.status, "job halted, returning");
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
                    batch.job_id,
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

        let recipients = self.resolve_recipients(&info, batch.users).await?;
        let topic = self.ctx.topic_name(&info.app.name, info.job.service);

        let stats = match publish_batch(&self.ctx, &info, &index, &topic, &recipients).await {
            Ok(stats) => stats,
            Err(DispatchError::Data(reason)) => {
                self.ctx
                    .store
                    .tag_job(batch.job_id, WORKER_NAME, EventState::Fail, &reason)
                    .await?;
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        advance_progress(&self.ctx, batch.job_id, stats.published).await?;
        if apply_circuit_breaker(&self.ctx, WORKER_NAME, &info, &stats).await? {
            return Ok(());
        }

        self.ctx
            .store
            .tag_job(batch.job_id, WORKER_NAME, EventState::Success, "finished")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bare_ids_and_joined_users() {
        let id = Uuid::new_v4();
        let message = Message::new(
            PROCESS_BATCH_QUEUE,
            json!([
                Uuid::new_v4().to_string(),
                "testapp",
                [
                    json!(id.to_string()),
                    json!({"user_id": id.to_string(), "token": "t", "locale": "en"}),
                ]
            ]),
        );
        let parsed = parse_batch_message(&message).unwrap();
        assert_eq!(parsed.users.len(), 2);
        assert!(matches!(parsed.users[0], BatchUser::Id(_)));
        assert!(matches!(parsed.users[1], BatchUser::User { .. }));
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        let message = Message::new(
            PROCESS_BATCH_QUEUE,
            json!([Uuid::new_v4().to_string(), "testapp"]),
        );
        let err = parse_batch_message(&message).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: invalid message array");

        let message = Message::new(
            PROCESS_BATCH_QUEUE,
            json!([Uuid::new_v4().to_string(), "testapp", [], []]),
        );
        assert!(parse_batch_message(&message).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_users() {
        let message = Message::new(
            PROCESS_BATCH_QUEUE,
            json!([Uuid::new_v4().to_string(), "testapp", []]),
        );
        let err = parse_batch_message(&message).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: there must be at least one user"
        );
    }

    #[test]
    fn test_parse_rejects_non_uuid_job_id() {
        let message = Message::new(
            PROCESS_BATCH_QUEUE,
            json!(["some-string", "testapp", [Uuid::new_v4().to_string()]]),
        );
        assert!(parse_batch_message(&message).is_err());
    }
}
