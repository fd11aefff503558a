use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::model::now_ns;
use crate::queue::Message;

/// Queue receiving messages that exhausted their retries, plus
/// per-recipient publish failures. Consumed out of band.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";

/// Process-wide broker: named queues with delayed delivery, lease-based
/// reservation and shared counters (used to coordinate multipart uploads
/// across workers). All state is internally locked; handles are cheap
/// `Arc` clones.
#[derive(Default)]
pub struct Broker {
    queues: DashMap<String, Arc<QueueState>>,
    counters: DashMap<String, u64>,
}

#[derive(Default)]
struct QueueState {
    ready: Mutex<VecDeque<Message>>,
    scheduled: Mutex<BinaryHeap<Scheduled>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

struct Scheduled {
    at_ns: i64,
    message: Message,
}

struct InFlight {
    message: Message,
    deadline_ns: i64,
}

// Min-heap by scheduled time.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at_ns
            .cmp(&self.at_ns)
            .then_with(|| other.message.jid.cmp(&self.message.jid))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.message.jid == other.message.jid
    }
}

impl Eq for Scheduled {}

impl Broker {
    pub fn new() -> Arc<Broker> {
        Arc::new(Broker::default())
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Enqueue for immediate delivery. Returns the message jid.
    pub fn enqueue(&self, queue: &str, args: Value) -> String {
        let message = Message::new(queue, args);
        let jid = message.jid.clone();
        debug!(queue, jid = %jid, "enqueue");
        self.queue(queue).ready.lock().push_back(message);
        jid
    }

    /// Enqueue for delivery at an absolute time (epoch nanoseconds).
    /// Times in the past deliver immediately.
    pub fn enqueue_at(&self, queue: &str, at_ns: i64, args: Value) -> String {
        if at_ns <= now_ns() {
            return self.enqueue(queue, args);
        }
        let message = Message::new(queue, args);
        let jid = message.jid.clone();
        debug!(queue, jid = %jid, at_ns, "enqueue scheduled");
        self.queue(queue).scheduled.lock().push(Scheduled {
            at_ns,
            message,
        });
        jid
    }

    pub fn enqueue_in(&self, queue: &str, delay: Duration, args: Value) -> String {
        self.enqueue_at(queue, now_ns() + delay.as_nanos() as i64, args)
    }

    /// Reserve the next message under a lease. Promotes due scheduled
    /// messages and reclaims expired leases first; an unacked message
    /// re-delivers with its retry count bumped.
    pub fn reserve(&self, queue: &str, lease: Duration) -> Option<Message> {
        let state = self.queue(queue);
        let now = now_ns();

        {
            let mut scheduled = state.scheduled.lock();
            let mut ready = state.ready.lock();
            while scheduled.peek().map_or(false, |s| s.at_ns <= now) {
                ready.push_back(scheduled.pop().expect("peeked").message);
            }

            let mut in_flight = state.in_flight.lock();
            let expired: Vec<String> = in_flight
                .iter()
                .filter(|(_, f)| f.deadline_ns <= now)
                .map(|(jid, _)| jid.clone())
                .collect();
            for jid in expired {
                if let Some(flight) = in_flight.remove(&jid) {
                    let mut message = flight.message;
                    message.retry_count += 1;
                    debug!(queue, jid = %message.jid, retry = message.retry_count, "lease expired, re-delivering");
                    ready.push_back(message);
                }
            }
        }

        let message = state.ready.lock().pop_front()?;
        state.in_flight.lock().insert(
            message.jid.clone(),
            InFlight {
                message: message.clone(),
                deadline_ns: now + lease.as_nanos() as i64,
            },
        );
        Some(message)
    }

    /// Acknowledge successful processing; the message will not re-deliver.
    pub fn ack(&self, queue: &str, jid: &str) -> bool {
        self.queue(queue).in_flight.lock().remove(jid).is_some()
    }

    /// Return a reserved message to the queue for immediate re-delivery.
    pub fn requeue(&self, queue: &str, jid: &str) -> bool {
        let state = self.queue(queue);
        let flight = state.in_flight.lock().remove(jid);
        match flight {
            Some(flight) => {
                let mut message = flight.message;
                message.retry_count += 1;
                state.ready.lock().push_back(message);
                true
            }
            None => false,
        }
    }

    pub fn dead_letter(&self, args: Value) {
        self.enqueue(DEAD_LETTER_QUEUE, args);
    }

    /// Ready messages (excludes scheduled and in-flight).
    pub fn ready_len(&self, queue: &str) -> usize {
        self.queue(queue).ready.lock().len()
    }

    /// Messages not yet acked: ready, scheduled and in-flight.
    pub fn pending_len(&self, queue: &str) -> usize {
        let state = self.queue(queue);
        let ready = state.ready.lock().len();
        let scheduled = state.scheduled.lock().len();
        let in_flight = state.in_flight.lock().len();
        ready + scheduled + in_flight
    }

    /// Whether any queue still has a message that could deliver now.
    pub fn any_due(&self) -> bool {
        let now = now_ns();
        self.queues.iter().any(|entry| {
            let state = entry.value();
            !state.ready.lock().is_empty()
                || state.scheduled.lock().peek().map_or(false, |s| s.at_ns <= now)
        })
    }

    /// Increment a shared counter, returning the new value. Used to detect
    /// the last acknowledged part of a multipart upload.
    pub fn incr_counter(&self, key: &str) -> u64 {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn remove_counter(&self, key: &str) {
        self.counters.remove(key);
    }
}
