// CSV splitting: batch arithmetic, operator CSVs, and the deterministic
// control group.

mod common;

use std::collections::HashSet;

use bytes::Bytes;
use common::{csv_lines, TestHarness};
use serde_json::json;
use stampede::config::Config;
use stampede::model::{JobStatus, Service};
use stampede::queue::{Message, Worker};
use stampede::storage::{JobStore, ObjectStorage};
use stampede::worker::{BatchUser, CsvSplitWorker, CSV_SPLIT_QUEUE, PROCESS_BATCH_QUEUE};
use uuid::Uuid;

fn small_batches() -> Config {
    let mut config = Config::default();
    config.workers.batch_size = 4;
    config
}

async fn harness_with_csv(
    config: Config,
    control_group: f64,
    ids: &[Uuid],
) -> (TestHarness, Uuid) {
    let harness = TestHarness::with_config(config);
    let app = harness.create_test_app("testapp").await;
    harness.create_test_template(app.id, "welcome", "en").await;
    let mut group = harness.create_test_group(&app, "welcome", &[]).await;
    group.control_group = control_group;
    group.csv_path = "uploads/audience.csv".to_string();
    harness.store.create_job_group(&group).await.unwrap();

    let mut job = stampede::model::Job::from_group(&group, Service::Apns);
    job.status = JobStatus::Scheduled;
    harness.store.create_job(&job).await.unwrap();

    let mut body = String::from("userIds\n");
    for id in ids {
        body.push_str(&id.to_string());
        body.push('\n');
    }
    harness
        .objects
        .put_object("uploads/audience.csv", Bytes::from(body))
        .await
        .unwrap();
    (harness, job.id)
}

async fn run_split(harness: &TestHarness, job_id: Uuid) {
    let worker = CsvSplitWorker::new(harness.ctx.clone());
    worker
        .process(Message::new(CSV_SPLIT_QUEUE, json!([job_id.to_string()])))
        .await
        .expect("csv split");
}

fn batch_user_ids(message: &Message) -> Vec<Uuid> {
    let users: Vec<BatchUser> =
        serde_json::from_value(message.args_array().unwrap()[2].clone()).unwrap();
    users
        .into_iter()
        .map(|user| match user {
            BatchUser::Id(id) => id,
            BatchUser::User { user_id, .. } => user_id,
        })
        .collect()
}

#[tokio::test]
async fn test_splits_into_ceil_batches_covering_the_input() {
    let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
    let (harness, job_id) = harness_with_csv(small_batches(), 0.0, &ids).await;
    run_split(&harness, job_id).await;

    let batches = harness.drain_queue(PROCESS_BATCH_QUEUE);
    assert_eq!(batches.len(), 3); // ceil(10 / 4)

    let mut union = HashSet::new();
    for message in &batches {
        assert_eq!(message.arg_str(0).unwrap(), job_id.to_string());
        assert_eq!(message.arg_str(1).unwrap(), "testapp");
        union.extend(batch_user_ids(message));
    }
    let input: HashSet<Uuid> = ids.into_iter().collect();
    assert_eq!(union, input);

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.total_batches, 3);
    assert_eq!(job.total_users, 10);
    assert_eq!(job.total_tokens, 0);
}

#[tokio::test]
async fn test_duplicate_and_junk_lines_are_dropped() {
    let id = Uuid::new_v4();
    let other = Uuid::new_v4();
    let mut body = String::from("userIds\n");
    body.push_str(&format!("{}\n{}\nnot-a-uuid\n{}\n\n", id, other, id));

    let (harness, job_id) = harness_with_csv(small_batches(), 0.0, &[]).await;
    harness
        .objects
        .put_object("uploads/audience.csv", Bytes::from(body))
        .await
        .unwrap();
    run_split(&harness, job_id).await;

    let batches = harness.drain_queue(PROCESS_BATCH_QUEUE);
    assert_eq!(batches.len(), 1);
    let users = batch_user_ids(&batches[0]);
    assert_eq!(users.len(), 2);

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.total_users, 2);
}

#[tokio::test]
async fn test_control_group_is_held_out_and_archived() {
    let ids: Vec<Uuid> = (0..2000).map(|_| Uuid::new_v4()).collect();
    let (harness, job_id) = harness_with_csv(Config::default(), 0.2, &ids).await;
    run_split(&harness, job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert!(!job.control_group_csv_path.is_empty());
    let control_lines = csv_lines(
        &harness
            .objects
            .get_object(&job.control_group_csv_path)
            .await
            .unwrap(),
    );
    assert_eq!(control_lines[0], "userIds");
    let held_out = control_lines.len() - 1;

    // held-out plus dispatched covers everyone exactly once
    let batches = harness.drain_queue(PROCESS_BATCH_QUEUE);
    let dispatched: usize = batches.iter().map(|m| batch_user_ids(m).len()).sum();
    assert_eq!(held_out + dispatched, ids.len());
    assert_eq!(job.total_users as usize, ids.len());

    // binomial bounds around p = 0.2 for n = 2000 (~5 sigma)
    let ratio = held_out as f64 / ids.len() as f64;
    assert!(ratio > 0.15 && ratio < 0.25, "control ratio was {}", ratio);

    // the held-out set never overlaps the dispatched set
    let control_set: HashSet<String> = control_lines[1..].iter().cloned().collect();
    for message in &batches {
        for id in batch_user_ids(message) {
            assert!(!control_set.contains(&id.to_string()));
        }
    }
}

#[tokio::test]
async fn test_control_group_is_stable_across_redelivery() {
    let ids: Vec<Uuid> = (0..500).map(|_| Uuid::new_v4()).collect();
    let (harness, job_id) = harness_with_csv(Config::default(), 0.3, &ids).await;

    run_split(&harness, job_id).await;
    let job = harness.store.get_job(job_id).await.unwrap();
    let first = harness
        .objects
        .get_object(&job.control_group_csv_path)
        .await
        .unwrap();

    // a re-delivered split message classifies every user the same way
    harness.drain_queue(PROCESS_BATCH_QUEUE);
    run_split(&harness, job_id).await;
    let second = harness
        .objects
        .get_object(&job.control_group_csv_path)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_empty_audience_completes_immediately() {
    let (harness, job_id) = harness_with_csv(small_batches(), 0.0, &[]).await;
    run_split(&harness, job_id).await;

    assert_eq!(harness.broker.pending_len(PROCESS_BATCH_QUEUE), 0);
    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.total_batches, 0);
    assert_ne!(job.completed_at, 0);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_halted_job_enqueues_nothing() {
    let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
    for status in [JobStatus::Paused, JobStatus::Stopped, JobStatus::CircuitBreak] {
        let (harness, job_id) = harness_with_csv(small_batches(), 0.0, &ids).await;
        harness.store.set_job_status(job_id, status).await.unwrap();
        run_split(&harness, job_id).await;
        assert_eq!(harness.broker.pending_len(PROCESS_BATCH_QUEUE), 0);
    }
}
