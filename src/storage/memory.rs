// In-memory drivers. Back the integration suites and local runs; behavior
// mirrors the production drivers operation for operation.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::filter::Filters;
use crate::model::{
    now_ns, App, EventState, Job, JobGroup, JobInfo, JobStatus, Service, Status, StatusEvent,
    Template,
};
use crate::storage::{JobStore, ObjectStorage, PublishedPush, PushBus, PushDb, PushUser};

#[derive(Default)]
pub struct MemoryJobStore {
    apps: RwLock<HashMap<Uuid, App>>,
    groups: RwLock<HashMap<Uuid, JobGroup>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    templates: RwLock<Vec<Template>>,
    statuses: RwLock<HashMap<(String, Uuid), Status>>,
    events: RwLock<Vec<StatusEvent>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, job_id: Uuid, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| DispatchError::NotFound(format!("job {}", job_id)))?;
        let out = f(job);
        job.updated_at = now_ns();
        Ok(out)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_app(&self, app: &App) -> Result<()> {
        self.apps.write().insert(app.id, app.clone());
        Ok(())
    }

    async fn get_app(&self, id: Uuid) -> Result<App> {
        self.apps
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("app {}", id)))
    }

    async fn create_template(&self, template: &Template) -> Result<()> {
        self.templates.write().push(template.clone());
        Ok(())
    }

    async fn templates_by_names(&self, app_id: Uuid, names: &[String]) -> Result<Vec<Template>> {
        Ok(self
            .templates
            .read()
            .iter()
            .filter(|t| t.app_id == app_id && names.contains(&t.name))
            .cloned()
            .collect())
    }

    async fn create_job_group(&self, group: &JobGroup) -> Result<()> {
        self.groups.write().insert(group.id, group.clone());
        Ok(())
    }

    async fn get_job_group(&self, id: Uuid) -> Result<JobGroup> {
        self.groups
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("job group {}", id)))
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("job {}", id)))
    }

    async fn jobs_by_group(&self, group_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.job_group_id == group_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_job_info(&self, id: Uuid) -> Result<JobInfo> {
        let job = self.get_job(id).await?;
        let group = self.get_job_group(job.job_group_id).await?;
        let app = self.get_app(group.app_id).await?;
        Ok(JobInfo { job, group, app })
    }

    async fn update_job_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()> {
        self.with_job(job_id, |job| job.csv_path = csv_path.to_string())
    }

    async fn update_control_group_csv_path(&self, job_id: Uuid, csv_path: &str) -> Result<()> {
        self.with_job(job_id, |job| {
            job.control_group_csv_path = csv_path.to_string()
        })
    }

    async fn set_job_db_page_size(&self, job_id: Uuid, db_page_size: i64) -> Result<()> {
        self.with_job(job_id, |job| job.db_page_size = db_page_size)
    }

    async fn set_job_totals(
        &self,
        job_id: Uuid,
        total_batches: i64,
        total_users: i64,
        total_tokens: i64,
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.total_batches = total_batches;
            job.total_users = total_users;
            job.total_tokens = total_tokens;
        })
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        self.with_job(job_id, |job| job.status = status)
    }

    async fn add_completed_batches(&self, job_id: Uuid, n: i64) -> Result<Job> {
        self.with_job(job_id, |job| {
            job.completed_batches += n;
            job.clone()
        })
    }

    async fn add_completed_tokens(&self, job_id: Uuid, n: i64) -> Result<()> {
        self.with_job(job_id, |job| job.completed_tokens += n)
    }

    async fn try_complete_job(&self, job_id: Uuid, now_ns: i64) -> Result<bool> {
        self.with_job(job_id, |job| {
            if job.completed_at == 0 && job.completed_batches >= job.total_batches {
                job.completed_at = now_ns;
                job.status = JobStatus::Completed;
                true
            } else {
                false
            }
        })
    }

    async fn tag_job(
        &self,
        job_id: Uuid,
        name: &str,
        state: EventState,
        message: &str,
    ) -> Result<()> {
        let status_id = {
            let mut statuses = self.statuses.write();
            statuses
                .entry((name.to_string(), job_id))
                .or_insert_with(|| Status {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    job_id,
                    created_at: now_ns(),
                })
                .id
        };
        self.events.write().push(StatusEvent {
            id: Uuid::new_v4(),
            status_id,
            state,
            message: message.to_string(),
            created_at: now_ns(),
        });
        Ok(())
    }

    async fn job_events(&self, job_id: Uuid) -> Result<Vec<(Status, Vec<StatusEvent>)>> {
        let statuses = self.statuses.read();
        let events = self.events.read();
        Ok(statuses
            .values()
            .filter(|s| s.job_id == job_id)
            .map(|status| {
                let status_events: Vec<StatusEvent> = events
                    .iter()
                    .filter(|e| e.status_id == status.id)
                    .cloned()
                    .collect();
                (status.clone(), status_events)
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPushDb {
    tables: RwLock<HashMap<String, Vec<PushUser>>>,
}

impl MemoryPushDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, table: &str, user: PushUser) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(user);
    }

    /// Distinct matching user ids in user-id order, the cursor's view.
    fn distinct_ids(&self, table: &str, filters: &Filters) -> Vec<Uuid> {
        let tables = self.tables.read();
        let mut ids: Vec<Uuid> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|u| filters.matches(u))
                    .map(|u| u.user_id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl PushDb for MemoryPushDb {
    async fn count_distinct_users(&self, table: &str, filters: &Filters) -> Result<i64> {
        Ok(self.distinct_ids(table, filters).len() as i64)
    }

    async fn page_seeds(
        &self,
        table: &str,
        filters: &Filters,
        page_size: i64,
        page_count: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = self.distinct_ids(table, filters);
        let mut seeds = Vec::with_capacity(page_count as usize);
        for page in 0..page_count {
            if page == 0 {
                seeds.push(Uuid::nil());
            } else {
                let index = (page * page_size - 1) as usize;
                match ids.get(index) {
                    Some(id) => seeds.push(*id),
                    None => break,
                }
            }
        }
        Ok(seeds)
    }

    async fn user_ids_after(
        &self,
        table: &str,
        filters: &Filters,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        Ok(self
            .distinct_ids(table, filters)
            .into_iter()
            .filter(|id| *id > after)
            .take(limit as usize)
            .collect())
    }

    async fn users_by_ids(&self, table: &str, ids: &[Uuid]) -> Result<Vec<PushUser>> {
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|u| wanted.contains(&u.user_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn users_in_seq_range(
        &self,
        table: &str,
        filters: &Filters,
        smallest: i64,
        biggest: i64,
    ) -> Result<Vec<PushUser>> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|u| u.seq_id > smallest && u.seq_id <= biggest)
                    .filter(|u| filters.matches(u))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn seq_bounds(&self, table: &str, filters: &Filters) -> Result<Option<(i64, i64)>> {
        let tables = self.tables.read();
        let bounds = tables.get(table).and_then(|rows| {
            rows.iter()
                .filter(|u| filters.matches(u))
                .map(|u| u.seq_id)
                .fold(None, |acc: Option<(i64, i64)>, seq| match acc {
                    None => Some((seq, seq)),
                    Some((lo, hi)) => Some((lo.min(seq), hi.max(seq))),
                })
        });
        Ok(bounds)
    }
}

#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<String, Bytes>>,
    uploads: RwLock<HashMap<String, BTreeMap<i32, Bytes>>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.objects.write().insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DispatchError::ObjectStorage(format!("no such object: {}", key)))
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let upload_id = format!("{}:{}", key, Uuid::new_v4());
        self.uploads.write().insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<()> {
        let mut uploads = self.uploads.write();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| DispatchError::ObjectStorage(format!("no such upload: {}", upload_id)))?;
        parts.insert(part_number, body);
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let parts = self
            .uploads
            .write()
            .remove(upload_id)
            .ok_or_else(|| DispatchError::ObjectStorage(format!("no such upload: {}", upload_id)))?;
        let mut assembled = Vec::new();
        for body in parts.values() {
            assembled.extend_from_slice(body);
        }
        self.objects
            .write()
            .insert(key.to_string(), Bytes::from(assembled));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPushBus {
    pushes: RwLock<Vec<PublishedPush>>,
    failing_tokens: RwLock<HashSet<String>>,
}

impl MemoryPushBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes to this device token fail, for failure-path tests.
    pub fn fail_token(&self, token: &str) {
        self.failing_tokens.write().insert(token.to_string());
    }

    pub fn published(&self) -> Vec<PublishedPush> {
        self.pushes.read().clone()
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        service: Service,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        if self.failing_tokens.read().contains(device_token) {
            return Err(DispatchError::Bus(format!(
                "publish refused for token {}",
                device_token
            )));
        }
        self.pushes.write().push(PublishedPush {
            service,
            topic: topic.to_string(),
            device_token: device_token.to_string(),
            body: body.clone(),
            metadata: metadata.clone(),
            push_metadata: push_metadata.clone(),
            push_expiry,
            template_name: template_name.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl PushBus for MemoryPushBus {
    async fn send_apns_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        self.record(
            Service::Apns,
            topic,
            device_token,
            body,
            metadata,
            push_metadata,
            push_expiry,
            template_name,
        )
    }

    async fn send_gcm_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        self.record(
            Service::Gcm,
            topic,
            device_token,
            body,
            metadata,
            push_metadata,
            push_expiry,
            template_name,
        )
    }
}

/// Bus that logs instead of publishing. Default sink when the crate is
/// built without the `kafka` feature.
#[derive(Default)]
pub struct LogPushBus;

#[async_trait]
impl PushBus for LogPushBus {
    async fn send_apns_push(
        &self,
        topic: &str,
        device_token: &str,
        _body: &Map<String, Value>,
        _metadata: &Map<String, Value>,
        _push_metadata: &Map<String, Value>,
        _push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        info!(topic, device_token, template_name, "apns push (log bus)");
        Ok(())
    }

    async fn send_gcm_push(
        &self,
        topic: &str,
        device_token: &str,
        _body: &Map<String, Value>,
        _metadata: &Map<String, Value>,
        _push_metadata: &Map<String, Value>,
        _push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        info!(topic, device_token, template_name, "gcm push (log bus)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: Uuid, locale: &str, seq: i64) -> PushUser {
        PushUser {
            user_id: id,
            token: format!("token-{}", seq),
            locale: locale.to_string(),
            tz: "-0300".to_string(),
            seq_id: seq,
            attrs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_distinct_count_collapses_duplicate_users() {
        let db = MemoryPushDb::new();
        let id = Uuid::new_v4();
        db.insert_user("app_apns", user(id, "en", 1));
        db.insert_user("app_apns", user(id, "en", 2));
        db.insert_user("app_apns", user(Uuid::new_v4(), "en", 3));
        let count = db
            .count_distinct_users("app_apns", &Filters::default())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_page_seeds_walk_the_id_order() {
        let db = MemoryPushDb::new();
        for i in 0..10 {
            db.insert_user("t", user(Uuid::new_v4(), "en", i));
        }
        let seeds = db.page_seeds("t", &Filters::default(), 4, 3).await.unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0], Uuid::nil());

        let ids = db.distinct_ids("t", &Filters::default());
        assert_eq!(seeds[1], ids[3]);
        assert_eq!(seeds[2], ids[7]);

        // pages reassemble the full id set without overlap
        let mut collected = Vec::new();
        for seed in &seeds {
            collected.extend(
                db.user_ids_after("t", &Filters::default(), *seed, 4)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(collected, ids);
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_part_order() {
        let storage = MemoryObjectStorage::new();
        let upload = storage.create_multipart_upload("k.csv").await.unwrap();
        // parts arrive out of order
        storage
            .upload_part("k.csv", &upload, 2, Bytes::from_static(b"b\n"))
            .await
            .unwrap();
        storage
            .upload_part("k.csv", &upload, 1, Bytes::from_static(b"a\n"))
            .await
            .unwrap();
        storage.complete_multipart_upload("k.csv", &upload).await.unwrap();
        let body = storage.get_object("k.csv").await.unwrap();
        assert_eq!(&body[..], b"a\nb\n");
    }

    #[tokio::test]
    async fn test_try_complete_job_single_winner() {
        let store = MemoryJobStore::new();
        let group = JobGroup::default();
        let mut job = Job::from_group(&group, Service::Apns);
        job.total_batches = 2;
        store.create_job(&job).await.unwrap();

        store.add_completed_batches(job.id, 2).await.unwrap();
        assert!(store.try_complete_job(job.id, 123).await.unwrap());
        assert!(!store.try_complete_job(job.id, 456).await.unwrap());
        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.completed_at, 123);
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_tag_job_upserts_status_and_appends_events() {
        let store = MemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store
            .tag_job(job_id, "csv_split_worker", EventState::Running, "starting")
            .await
            .unwrap();
        store
            .tag_job(job_id, "csv_split_worker", EventState::Success, "finished")
            .await
            .unwrap();
        let events = store.job_events(job_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.len(), 2);
        assert_eq!(events[0].1[1].state, EventState::Success);
    }

    #[tokio::test]
    async fn test_bus_failure_injection() {
        let bus = MemoryPushBus::new();
        bus.fail_token("bad");
        let empty = Map::new();
        assert!(bus
            .send_apns_push("t", "good", &empty, &empty, &empty, 0, "tpl")
            .await
            .is_ok());
        assert!(bus
            .send_apns_push("t", "bad", &empty, &empty, &empty, 0, "tpl")
            .await
            .is_err());
        assert_eq!(bus.published().len(), 1);
    }
}
