use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::{Broker, Message};

/// A pipeline stage: pulls from one named queue, processes one message at a
/// time, and enqueues work for the next stage through the broker.
///
/// Returning `Ok` acks the message. A retryable error re-delivers it
/// (at-least-once); a non-retryable error or exhausted retries dead-letters
/// it. Data errors (failed job, empty audience) are handled inside the
/// worker by tagging the job and returning `Ok`.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    fn queue(&self) -> &'static str;

    /// Per-queue concurrency override; `None` uses the runtime default.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    async fn process(&self, message: Message) -> Result<()>;
}

/// Drives registered workers against the broker.
pub struct WorkerRuntime {
    broker: Arc<Broker>,
    config: QueueConfig,
    workers: Vec<Arc<dyn Worker>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerRuntime {
    pub fn new(broker: Arc<Broker>, config: QueueConfig) -> WorkerRuntime {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerRuntime {
            broker,
            config,
            workers: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        info!(worker = worker.name(), queue = worker.queue(), "registered worker");
        self.workers.push(worker);
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn one pump task per registered worker. Tasks exit on shutdown.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let broker = self.broker.clone();
                let config = self.config.clone();
                let mut shutdown = self.shutdown_rx.clone();
                tokio::spawn(async move {
                    let lease = Duration::from_secs(config.lease_secs);
                    let poll = Duration::from_millis(config.poll_interval_ms);
                    let limit = worker.concurrency().unwrap_or(config.concurrency).max(1);
                    let permits = Arc::new(Semaphore::new(limit));
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match broker.reserve(worker.queue(), lease) {
                            Some(message) => {
                                let permit = permits
                                    .clone()
                                    .acquire_owned()
                                    .await
                                    .expect("semaphore never closed");
                                let worker = worker.clone();
                                let broker = broker.clone();
                                let max_retries = config.max_retries;
                                tokio::spawn(async move {
                                    handle_message(&*worker, &broker, message, max_retries).await;
                                    drop(permit);
                                });
                            }
                            None => {
                                tokio::select! {
                                    _ = tokio::time::sleep(poll) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Run until shutdown is requested.
    pub async fn run(&self) {
        let handles = self.spawn();
        let mut shutdown = self.shutdown_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker runtime stopped");
    }

    /// Process messages inline, one at a time, until no queue has a due
    /// message. Deterministic drain used by integration tests and one-shot
    /// runs; future-scheduled messages are left in place.
    pub async fn run_until_idle(&self) {
        let lease = Duration::from_secs(self.config.lease_secs);
        loop {
            let mut processed = false;
            for worker in &self.workers {
                while let Some(message) = self.broker.reserve(worker.queue(), lease) {
                    handle_message(&**worker, &self.broker, message, self.config.max_retries)
                        .await;
                    processed = true;
                }
            }
            if !processed {
                break;
            }
        }
    }
}

async fn handle_message(
    worker: &dyn Worker,
    broker: &Broker,
    message: Message,
    max_retries: u32,
) {
    let queue = worker.queue();
    let jid = message.jid.clone();
    match worker.process(message.clone()).await {
        Ok(()) => {
            broker.ack(queue, &jid);
        }
        Err(err) if err.is_retryable() && message.retry_count < max_retries => {
            warn!(
                worker = worker.name(),
                jid = %jid,
                retry = message.retry_count,
                error = %err,
                "worker failed, message will re-deliver"
            );
            broker.requeue(queue, &jid);
        }
        Err(err) => {
            error!(
                worker = worker.name(),
                jid = %jid,
                error = %err,
                "worker failed permanently, dead-lettering message"
            );
            broker.ack(queue, &jid);
            broker.dead_letter(json!({
                "queue": queue,
                "jid": jid,
                "args": message.args,
                "error": err.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::queue::DEAD_LETTER_QUEUE;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_first_n: Mutex<u32>,
        retryable: bool,
    }

    #[async_trait]
    impl Worker for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn queue(&self) -> &'static str {
            "recorder_queue"
        }

        async fn process(&self, message: Message) -> Result<()> {
            let mut budget = self.fail_first_n.lock();
            if *budget > 0 {
                *budget -= 1;
                return if self.retryable {
                    Err(DispatchError::Storage("flaky".into()))
                } else {
                    Err(DispatchError::Validation("bad".into()))
                };
            }
            self.seen.lock().push(message.arg_str(0)?.to_string());
            Ok(())
        }
    }

    fn runtime_with(worker: Arc<dyn Worker>) -> WorkerRuntime {
        let mut runtime = WorkerRuntime::new(Broker::new(), QueueConfig::default());
        runtime.register(worker);
        runtime
    }

    #[tokio::test]
    async fn test_run_until_idle_processes_everything() {
        let worker = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_first_n: Mutex::new(0),
            retryable: true,
        });
        let runtime = runtime_with(worker.clone());
        for i in 0..5 {
            runtime.broker().enqueue("recorder_queue", json!([i.to_string()]));
        }
        runtime.run_until_idle().await;
        assert_eq!(worker.seen.lock().len(), 5);
        assert_eq!(runtime.broker().pending_len("recorder_queue"), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_retries_then_succeeds() {
        let worker = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_first_n: Mutex::new(2),
            retryable: true,
        });
        let runtime = runtime_with(worker.clone());
        runtime.broker().enqueue("recorder_queue", json!(["x"]));
        runtime.run_until_idle().await;
        assert_eq!(worker.seen.lock().as_slice(), ["x"]);
        assert_eq!(runtime.broker().ready_len(DEAD_LETTER_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters() {
        let worker = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_first_n: Mutex::new(1),
            retryable: false,
        });
        let runtime = runtime_with(worker.clone());
        runtime.broker().enqueue("recorder_queue", json!(["x"]));
        runtime.run_until_idle().await;
        assert!(worker.seen.lock().is_empty());
        assert_eq!(runtime.broker().ready_len(DEAD_LETTER_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_dead_letter() {
        let worker = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_first_n: Mutex::new(u32::MAX),
            retryable: true,
        });
        let mut config = QueueConfig::default();
        config.max_retries = 2;
        let mut runtime = WorkerRuntime::new(Broker::new(), config);
        runtime.register(worker.clone());
        runtime.broker().enqueue("recorder_queue", json!(["x"]));
        runtime.run_until_idle().await;
        assert_eq!(runtime.broker().ready_len(DEAD_LETTER_QUEUE), 1);
        assert_eq!(runtime.broker().pending_len("recorder_queue"), 0);
    }
}
