//! Native broker state.
//!
//! - `WorkQueue`: round-robin dispatch, buffering while nobody pulls
//! - `TopicQueue`: pattern-filtered fan-out, dropping when nobody matches
//! - `WireMessage`: what workers and the coordinator say to each other
//! - `Coordinator`: owns the queues and reacts to worker traffic

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub mod coordinator;
pub mod message;
pub mod topic_queue;
pub mod work_queue;

pub use coordinator::Coordinator;
pub use message::WireMessage;
pub use topic_queue::{Delivery, DeliverySink, SubscriptionId, TopicQueue};
pub use work_queue::{Endpoint, HandleId, LocalEndpoint, WorkItem, WorkQueue};

use crate::cluster::WorkerRegistry;

/// Lazily created named queues owned by one broker side.
#[derive(Debug)]
pub struct QueueRegistry {
    work_queues: Mutex<HashMap<String, WorkQueue>>,
    topic_queues: Mutex<HashMap<String, TopicQueue>>,
    workers: Option<WorkerRegistry>,
    buffer_limit: Option<usize>,
}

impl QueueRegistry {
    /// Coordinator side: topic publishes reach every worker in `workers`.
    pub fn coordinator(workers: WorkerRegistry, buffer_limit: Option<usize>) -> Self {
        Self::build(Some(workers), buffer_limit)
    }

    /// Worker side: queues only serve facades in this process.
    pub fn local(buffer_limit: Option<usize>) -> Self {
        Self::build(None, buffer_limit)
    }

    fn build(workers: Option<WorkerRegistry>, buffer_limit: Option<usize>) -> Self {
        Self {
            work_queues: Mutex::default(),
            topic_queues: Mutex::default(),
            workers,
            buffer_limit,
        }
    }

    /// The work queue called `name`, created on first use.
    pub fn work_queue(&self, name: &str) -> WorkQueue {
        self.work_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| WorkQueue::with_buffer_limit(name, self.buffer_limit))
            .clone()
    }

    /// The topic queue called `name`, created on first use.
    pub fn topic_queue(&self, name: &str) -> TopicQueue {
        self.topic_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| match &self.workers {
                Some(workers) => TopicQueue::new(name, workers.clone()),
                None => TopicQueue::local(name),
            })
            .clone()
    }

    /// Snapshot of every work queue created so far.
    pub fn work_queues(&self) -> Vec<WorkQueue> {
        self.work_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
