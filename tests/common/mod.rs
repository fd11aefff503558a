// Shared fixtures for the integration suites: an in-memory deployment of
// the whole pipeline plus builders for apps, templates, groups and jobs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stampede::config::Config;
use stampede::model::{App, Job, JobGroup, JobStatus, Service, Template};
use stampede::queue::{Broker, Message, Worker, WorkerRuntime};
use stampede::storage::{
    JobStore, MemoryJobStore, MemoryObjectStorage, MemoryPushBus, MemoryPushDb, PushUser,
};
use stampede::worker::{
    CreateBatchesFromFiltersWorker, CsvSplitWorker, DbToCsvWorker, DirectWorker,
    JobGroupExpanderWorker, ProcessBatchWorker, WorkerContext,
};
use uuid::Uuid;

pub struct TestHarness {
    pub config: Config,
    pub broker: Arc<Broker>,
    pub store: Arc<MemoryJobStore>,
    pub push_db: Arc<MemoryPushDb>,
    pub objects: Arc<MemoryObjectStorage>,
    pub bus: Arc<MemoryPushBus>,
    pub ctx: Arc<WorkerContext>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let broker = Broker::new();
        let store = Arc::new(MemoryJobStore::new());
        let push_db = Arc::new(MemoryPushDb::new());
        let objects = Arc::new(MemoryObjectStorage::new());
        let bus = Arc::new(MemoryPushBus::new());
        let ctx = Arc::new(WorkerContext {
            config: config.clone(),
            broker: broker.clone(),
            store: store.clone(),
            push_db: push_db.clone(),
            objects: objects.clone(),
            bus: bus.clone(),
        });
        Self {
            config,
            broker,
            store,
            push_db,
            objects,
            bus,
            ctx,
        }
    }

    /// A runtime with every pipeline worker registered.
    pub fn runtime(&self) -> WorkerRuntime {
        let mut runtime = WorkerRuntime::new(self.broker.clone(), self.config.queue.clone());
        runtime.register(Arc::new(JobGroupExpanderWorker::new(self.ctx.clone())));
        runtime.register(Arc::new(CreateBatchesFromFiltersWorker::new(self.ctx.clone())));
        runtime.register(Arc::new(DbToCsvWorker::new(self.ctx.clone())));
        runtime.register(Arc::new(CsvSplitWorker::new(self.ctx.clone())));
        runtime.register(Arc::new(ProcessBatchWorker::new(self.ctx.clone())));
        runtime.register(Arc::new(DirectWorker::new(self.ctx.clone())));
        runtime
    }

    /// Pull every ready message off a queue without processing it.
    pub fn drain_queue(&self, queue: &str) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.broker.reserve(queue, Duration::from_secs(60)) {
            self.broker.ack(queue, &message.jid);
            messages.push(message);
        }
        messages
    }

    /// Process every ready message on one worker's queue, panicking on
    /// worker errors. Returns how many messages were processed.
    pub async fn process_queue<W: Worker>(&self, worker: &W) -> usize {
        let mut processed = 0;
        while let Some(message) = self.broker.reserve(worker.queue(), Duration::from_secs(60)) {
            worker
                .process(message.clone())
                .await
                .expect("worker process");
            self.broker.ack(worker.queue(), &message.jid);
            processed += 1;
        }
        processed
    }

    pub async fn create_test_app(&self, name: &str) -> App {
        let app = App {
            id: Uuid::new_v4(),
            name: name.to_string(),
            bundle_id: format!("com.app.{}", name),
            created_by: "test@test.com".to_string(),
            created_at: 0,
        };
        self.store.create_app(&app).await.expect("create app");
        app
    }

    pub async fn create_test_template(
        &self,
        app_id: Uuid,
        name: &str,
        locale: &str,
    ) -> Template {
        let template = Template {
            id: Uuid::new_v4(),
            app_id,
            name: name.to_string(),
            locale: locale.to_string(),
            defaults: [
                ("user_name".to_string(), "Someone".to_string()),
                ("object_name".to_string(), "village".to_string()),
            ]
            .into(),
            body: [(
                "alert".to_string(),
                "{{user_name}} just liked your {{object_name}}!".to_string(),
            )]
            .into(),
            compiled_body: String::new(),
            created_by: "test@test.com".to_string(),
            created_at: 0,
        };
        self.store
            .create_template(&template)
            .await
            .expect("create template");
        template
    }

    pub async fn create_test_group(
        &self,
        app: &App,
        template_name: &str,
        filters: &[(&str, &str)],
    ) -> JobGroup {
        let group = JobGroup {
            id: Uuid::new_v4(),
            app_id: app.id,
            template_name: template_name.to_string(),
            filters: filters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_by: "test@test.com".to_string(),
            ..Default::default()
        };
        self.store
            .create_job_group(&group)
            .await
            .expect("create job group");
        group
    }

    /// A scheduled job for one platform, the state the expander leaves it in.
    pub async fn create_test_job(&self, group: &JobGroup, service: Service) -> Job {
        let mut job = Job::from_group(group, service);
        job.status = JobStatus::Scheduled;
        self.store.create_job(&job).await.expect("create job");
        job
    }

    pub fn seed_user(&self, table: &str, user_id: &str, locale: &str, tz: &str, seq_id: i64) {
        self.push_db.insert_user(
            table,
            PushUser {
                user_id: user_id.parse().expect("fixture uuid"),
                token: format!("token-{}", seq_id),
                locale: locale.to_string(),
                tz: tz.to_string(),
                seq_id,
                attrs: BTreeMap::new(),
            },
        );
    }

    /// The canonical `testapp_apns` fixture table:
    /// 4 `en` users, 6 `pt` users (4 of them in tz -0300), 1 `au` user and
    /// 4 `es` users; 9 distinct users sit in tz -0500/-0800.
    pub fn seed_testapp_users(&self) {
        let t = "testapp_apns";
        self.seed_user(t, "57be9009-e616-42c6-9cfe-505508ede2d0", "en", "-0500", 1);
        self.seed_user(t, "5c3033c0-24ad-487a-a80d-68432464c8de", "en", "-0500", 2);
        self.seed_user(t, "2df5bb01-15d1-4569-bc56-49fa0a33c4c3", "en", "-0300", 3);
        self.seed_user(t, "21854bbf-ea7e-43e3-8f79-9ab2c121b941", "en", "-0300", 4);
        self.seed_user(t, "9e558649-9c23-469d-a11c-59b05813e3d5", "pt", "-0300", 5);
        self.seed_user(t, "a8e8d2d5-f178-4d90-9b31-683ad3aae920", "pt", "-0300", 6);
        self.seed_user(t, "4223171e-c665-4612-9edd-485f229240bf", "pt", "-0300", 7);
        self.seed_user(t, "67b872de-8ae4-4763-aef8-7c87a7f928a7", "pt", "-0500", 8);
        self.seed_user(t, "3f8732a1-8642-4f22-8d77-a9688dd6a5ae", "pt", "-0300", 9);
        self.seed_user(t, "843a61f8-45b3-44f9-9ab7-8becb2765653", "pt", "-0800", 10);
        self.seed_user(t, "843a61f8-45b3-44f9-9ab7-8becb3365653", "au", "-0800", 11);
        self.seed_user(t, "843a61f8-45b3-44f9-aaaa-8becb3365653", "es", "-0500", 12);
        self.seed_user(t, "e78431ca-69a8-4326-af1f-48f817a4a669", "es", "-0800", 13);
        self.seed_user(t, "d9b42bb8-78ca-44d0-ae50-a472d9fbad92", "es", "-0500", 14);
        self.seed_user(t, "ee4455fe-8ff6-4878-8d7c-aec096bd68b4", "es", "-0800", 15);
    }
}

/// Lines of a CSV object, in file order.
pub fn csv_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .map(str::to_string)
        .collect()
}

/// The fail/success messages tagged for a job by any worker.
pub async fn event_messages(store: &MemoryJobStore, job_id: Uuid) -> Vec<(String, String)> {
    store
        .job_events(job_id)
        .await
        .expect("job events")
        .into_iter()
        .flat_map(|(_, events)| {
            events
                .into_iter()
                .map(|e| (e.state.to_string(), e.message))
        })
        .collect()
}
