//! Queue and worker runtime.
//!
//! A process-wide broker holds named queues of JSON messages. Messages are
//! reserved under a lease, acked on successful processing, and re-delivered
//! when a lease expires — at-least-once delivery, so workers are idempotent.
//! The runtime pumps each registered worker's queue under a per-queue
//! concurrency cap; back-pressure is queue depth, never in-process buffering.

mod broker;
mod message;
mod runtime;

pub use broker::{Broker, DEAD_LETTER_QUEUE};
pub use message::Message;
pub use runtime::{Worker, WorkerRuntime};
