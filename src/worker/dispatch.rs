// Shared render-and-publish path for the batch processor and the direct
// dispatcher: template selection, locale fallback, per-recipient metadata
// and the bus call, with per-recipient failures dead-lettered instead of
// silently dropped.

use std::collections::HashMap;

use chrono::Utc;
use rand::seq::IndexedRandom;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{now_ns, JobInfo, Service, Template};
use crate::storage::PushUser;
use crate::template::build_message;
use crate::worker::WorkerContext;

/// `name -> locale -> template`.
pub(crate) type TemplateIndex = HashMap<String, HashMap<String, Template>>;

pub(crate) fn build_template_index(templates: Vec<Template>) -> TemplateIndex {
    let mut index: TemplateIndex = HashMap::new();
    for template in templates {
        index
            .entry(template.name.clone())
            .or_default()
            .insert(template.locale.clone(), template);
    }
    index
}

/// One deliverable recipient.
#[derive(Debug, Clone)]
pub(crate) struct Recipient {
    pub user_id: Uuid,
    pub token: String,
    pub locale: String,
}

impl From<PushUser> for Recipient {
    fn from(user: PushUser) -> Recipient {
        Recipient {
            user_id: user.user_id,
            token: user.token,
            locale: user.locale,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
}

/// Uniform per-recipient pick from the (possibly comma-split) name list.
fn pick_template_name(names: &[String]) -> &str {
    if names.len() == 1 {
        return &names[0];
    }
    names
        .choose(&mut rand::rng())
        .map(String::as_str)
        .unwrap_or_default()
}

fn resolve_template<'a>(
    index: &'a TemplateIndex,
    name: &str,
    locale: &str,
) -> Result<&'a Template> {
    let by_locale = index.get(name);
    by_locale
        .and_then(|templates| templates.get(&locale.to_lowercase()))
        .or_else(|| by_locale.and_then(|templates| templates.get("en")))
        .ok_or_else(|| {
            DispatchError::Data("there is no template for the given locale or 'en'".to_string())
        })
}

/// Render and publish one batch of recipients. Transient per-recipient
/// publish failures are counted and dead-lettered; data errors (missing
/// template) fail the whole batch.
pub(crate) async fn publish_batch(
    ctx: &WorkerContext,
    info: &JobInfo,
    index: &TemplateIndex,
    topic: &str,
    recipients: &[Recipient],
) -> Result<DispatchStats> {
    let names = info.template_names();
    let dry_run = info.group.dry_run();
    let mut stats = DispatchStats::default();

    for recipient in recipients {
        stats.attempted += 1;
        let template_name = pick_template_name(&names);
        let template = resolve_template(index, template_name, &recipient.locale)?;
        let body = build_message(template, &info.group.context)?;

        let mut push_metadata = Map::new();
        push_metadata.insert("userId".into(), json!(recipient.user_id.to_string()));
        push_metadata.insert("pushTime".into(), json!(Utc::now().timestamp()));
        push_metadata.insert("templateName".into(), json!(template_name));
        push_metadata.insert("jobId".into(), json!(info.job.id.to_string()));
        push_metadata.insert("pushType".into(), json!("massive"));
        push_metadata.insert("muid".into(), json!(Uuid::new_v4().to_string()));
        if dry_run {
            push_metadata.insert("dryRun".into(), json!(true));
        }

        let sent = send_push(
            ctx,
            info.job.service,
            topic,
            &recipient.token,
            &body,
            &info.group.metadata,
            &push_metadata,
            info.job.push_expiry_seconds(),
            template_name,
        )
        .await;

        match sent {
            Ok(()) => stats.published += 1,
            Err(err) => {
                stats.failed += 1;
                warn!(
                    job_id = %info.job.id,
                    user_id = %recipient.user_id,
                    error = %err,
                    "publish failed, dead-lettering recipient"
                );
                ctx.broker.dead_letter(json!({
                    "jobId": info.job.id.to_string(),
                    "userId": recipient.user_id.to_string(),
                    "reason": err.to_string(),
                }));
            }
        }
    }

    debug!(
        job_id = %info.job.id,
        attempted = stats.attempted,
        published = stats.published,
        failed = stats.failed,
        "batch published"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn send_push(
    ctx: &WorkerContext,
    service: Service,
    topic: &str,
    token: &str,
    body: &Map<String, Value>,
    metadata: &Map<String, Value>,
    push_metadata: &Map<String, Value>,
    push_expiry: i64,
    template_name: &str,
) -> Result<()> {
    match service {
        Service::Apns => {
            ctx.bus
                .send_apns_push(topic, token, body, metadata, push_metadata, push_expiry, template_name)
                .await
        }
        Service::Gcm => {
            ctx.bus
                .send_gcm_push(topic, token, body, metadata, push_metadata, push_expiry, template_name)
                .await
        }
    }
}

/// Advance job progress after a batch: token and batch counters move by
/// storage-side arithmetic, then the conditional completion write runs if
/// this batch looks like the last one. At most one concurrent worker wins
/// the completion.
pub(crate) async fn advance_progress(
    ctx: &WorkerContext,
    job_id: Uuid,
    published: usize,
) -> Result<()> {
    ctx.store
        .add_completed_tokens(job_id, published as i64)
        .await?;
    let job = ctx.store.add_completed_batches(job_id, 1).await?;
    if job.completed_batches >= job.total_batches && job.completed_at == 0 {
        ctx.store.try_complete_job(job_id, now_ns()).await?;
    }
    Ok(())
}

/// Trip the job to circuitbreak when the failure ratio crosses the
/// configured threshold. Returns whether it tripped.
pub(crate) async fn apply_circuit_breaker(
    ctx: &WorkerContext,
    worker_name: &str,
    info: &JobInfo,
    stats: &DispatchStats,
) -> Result<bool> {
    if stats.failed == 0 || stats.attempted == 0 {
        return Ok(false);
    }
    let ratio = stats.failed as f64 / stats.attempted as f64;
    if ratio < ctx.config.workers.circuit_break_ratio {
        return Ok(false);
    }
    ctx.store
        .set_job_status(info.job.id, crate::model::JobStatus::CircuitBreak)
        .await?;
    ctx.store
        .tag_job(
            info.job.id,
            worker_name,
            crate::model::EventState::Fail,
            &format!(
                "circuit break: {}/{} publishes failed",
                stats.failed, stats.attempted
            ),
        )
        .await?;
    Ok(true)
}
