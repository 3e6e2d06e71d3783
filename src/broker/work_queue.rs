//! Round-robin work queue.
//!
//! Items pushed while no endpoint is registered are buffered. Registering an
//! endpoint schedules a flush on a later scheduler turn; until that flush runs,
//! new pushes also go to the buffer so the original submission order holds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::Payload;
use crate::cluster::WorkerId;

/// Identifies a delivery endpoint registered on a work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleId {
    /// A worker process, reached over its link.
    Worker(WorkerId),
    /// A pull facade in this process.
    Local(Uuid),
}

impl HandleId {
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local-{id}"),
        }
    }
}

/// A payload bound for a named work queue.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub queue: String,
    pub payload: Payload,
}

impl WorkItem {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue: queue.into(),
            payload,
        }
    }
}

/// Something a work queue can hand items to.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> HandleId;

    /// Deliver `item`, or hand it back if the receiving side is gone.
    fn deliver(&self, item: WorkItem) -> std::result::Result<(), WorkItem>;
}

/// Endpoint feeding a pull facade in this process.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    id: HandleId,
    sink: mpsc::UnboundedSender<Payload>,
}

impl LocalEndpoint {
    pub fn new(id: HandleId, sink: mpsc::UnboundedSender<Payload>) -> Self {
        Self { id, sink }
    }
}

impl Endpoint for LocalEndpoint {
    fn id(&self) -> HandleId {
        self.id
    }

    fn deliver(&self, item: WorkItem) -> std::result::Result<(), WorkItem> {
        let WorkItem { queue, payload } = item;
        self.sink
            .send(payload)
            .map_err(|rejected| WorkItem::new(queue, rejected.0))
    }
}

struct State {
    name: Arc<str>,
    buffer: VecDeque<WorkItem>,
    workers: Vec<Arc<dyn Endpoint>>,
    next_worker: usize,
    flush_scheduled: bool,
    buffer_limit: Option<usize>,
}

impl State {
    /// Hand `item` to the next live endpoint, or buffer it.
    fn dispatch(&mut self, mut item: WorkItem) {
        loop {
            if self.workers.is_empty() {
                self.enqueue(item);
                return;
            }

            let index = self.next_worker % self.workers.len();
            match self.workers[index].deliver(item) {
                Ok(()) => {
                    self.next_worker = index + 1;
                    return;
                }
                Err(returned) => {
                    let gone = self.workers.remove(index);
                    warn!(
                        queue = %self.name,
                        worker = %gone.id(),
                        "Endpoint is gone, removing it and retrying delivery"
                    );
                    self.next_worker = index;
                    item = returned;
                }
            }
        }
    }

    fn enqueue(&mut self, item: WorkItem) {
        if let Some(limit) = self.buffer_limit {
            while self.buffer.len() >= limit.max(1) {
                if self.buffer.pop_front().is_some() {
                    warn!(queue = %self.name, limit, "Work queue buffer full, dropped oldest item");
                }
            }
        }
        self.buffer.push_back(item);
    }
}

/// Named round-robin dispatcher over a mutable endpoint set.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    state: Arc<Mutex<State>>,
}

impl WorkQueue {
    /// Create an unbounded queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_buffer_limit(name, None)
    }

    /// Create a queue whose buffer keeps at most `limit` items, dropping the oldest.
    pub fn with_buffer_limit(name: impl Into<String>, limit: Option<usize>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        Self {
            state: Arc::new(Mutex::new(State {
                name: Arc::clone(&name),
                buffer: VecDeque::new(),
                workers: Vec::new(),
                next_worker: 0,
                flush_scheduled: false,
                buffer_limit: limit,
            })),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver to the next endpoint in rotation, or buffer.
    ///
    /// While a flush is pending the item joins the buffer behind the items
    /// already waiting, even if endpoints are registered; the flush hands them
    /// all out in order. The buffer limit only applies while no endpoint is
    /// registered.
    pub fn push(&self, item: WorkItem) {
        let mut state = self.lock();
        if !state.flush_scheduled {
            state.dispatch(item);
        } else if state.workers.is_empty() {
            state.enqueue(item);
        } else {
            state.buffer.push_back(item);
        }
    }

    /// Add an endpoint and schedule a flush of the buffer.
    pub fn register_worker(&self, endpoint: Arc<dyn Endpoint>) {
        let schedule = {
            let mut state = self.lock();
            debug!(queue = %self.name, worker = %endpoint.id(), "Endpoint registered");
            state.workers.push(endpoint);
            !std::mem::replace(&mut state.flush_scheduled, true)
        };

        if schedule {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let queue = self.clone();
                    runtime.spawn(async move { queue.flush() });
                }
                Err(_) => self.flush(),
            }
        }
    }

    /// Remove the first endpoint with this id. Returns whether one was found.
    pub fn unregister_worker(&self, id: HandleId) -> bool {
        let mut state = self.lock();
        match state.workers.iter().position(|w| w.id() == id) {
            Some(index) => {
                state.workers.remove(index);
                debug!(queue = %self.name, worker = %id, "Endpoint unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove every endpoint with this id. Returns how many were removed.
    pub fn purge_worker(&self, id: HandleId) -> usize {
        let mut state = self.lock();
        let before = state.workers.len();
        state.workers.retain(|w| w.id() != id);
        let removed = before - state.workers.len();
        if removed > 0 {
            debug!(queue = %self.name, worker = %id, removed, "Endpoints purged");
        }
        removed
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Items waiting for an endpoint.
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn flush(&self) {
        let mut state = self.lock();
        state.flush_scheduled = false;
        let pending = std::mem::take(&mut state.buffer);
        if !pending.is_empty() {
            debug!(queue = %self.name, count = pending.len(), "Flushing buffered items");
        }
        for item in pending {
            state.dispatch(item);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("workers", &state.workers.len())
            .field("buffered", &state.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint() -> (Arc<LocalEndpoint>, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(LocalEndpoint::new(HandleId::new_local(), tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload);
        }
        out
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_round_robin() {
        let queue = WorkQueue::new("jobs");
        let (w0, mut r0) = endpoint();
        let (w1, mut r1) = endpoint();
        let (w2, mut r2) = endpoint();
        queue.register_worker(w0);
        queue.register_worker(w1);
        queue.register_worker(w2);
        settle().await;

        for i in 0..6 {
            queue.push(WorkItem::new("jobs", json!(i)));
        }

        assert_eq!(drain(&mut r0), vec![json!(0), json!(3)]);
        assert_eq!(drain(&mut r1), vec![json!(1), json!(4)]);
        assert_eq!(drain(&mut r2), vec![json!(2), json!(5)]);
    }

    #[tokio::test]
    async fn test_buffer_then_flush() {
        let queue = WorkQueue::new("jobs");
        for i in 0..3 {
            queue.push(WorkItem::new("jobs", json!(i)));
        }
        assert_eq!(queue.buffered(), 3);

        let (w0, mut r0) = endpoint();
        queue.register_worker(w0);

        // Nothing is delivered before the flush turn.
        assert!(drain(&mut r0).is_empty());
        // Pushes during the pending flush keep their place in line.
        queue.push(WorkItem::new("jobs", json!(3)));

        settle().await;
        assert_eq!(
            drain(&mut r0),
            vec![json!(0), json!(1), json!(2), json!(3)]
        );
        assert_eq!(queue.buffered(), 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let queue = WorkQueue::new("jobs");
        let (w0, _r0) = endpoint();
        let id = w0.id();
        queue.register_worker(w0);

        assert!(queue.unregister_worker(id));
        assert!(!queue.unregister_worker(id));
        assert_eq!(queue.worker_count(), 0);

        queue.push(WorkItem::new("jobs", json!("kept")));
        settle().await;
        assert_eq!(queue.buffered(), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_first_occurrence_only() {
        let queue = WorkQueue::new("jobs");
        let (w0, mut r0) = endpoint();
        queue.register_worker(w0.clone());
        queue.register_worker(w0.clone());
        settle().await;

        assert!(queue.unregister_worker(w0.id()));
        assert_eq!(queue.worker_count(), 1);

        queue.push(WorkItem::new("jobs", json!(1)));
        assert_eq!(drain(&mut r0), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_purge_removes_all_occurrences() {
        let queue = WorkQueue::new("jobs");
        let (w0, _r0) = endpoint();
        let (w1, _r1) = endpoint();
        queue.register_worker(w0.clone());
        queue.register_worker(w1);
        queue.register_worker(w0.clone());

        assert_eq!(queue.purge_worker(w0.id()), 2);
        assert_eq!(queue.purge_worker(w0.id()), 0);
        assert_eq!(queue.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_endpoint_is_skipped() {
        let queue = WorkQueue::new("jobs");
        let (w0, r0) = endpoint();
        let (w1, mut r1) = endpoint();
        queue.register_worker(w0);
        queue.register_worker(w1);
        settle().await;
        drop(r0);

        queue.push(WorkItem::new("jobs", json!("a")));
        queue.push(WorkItem::new("jobs", json!("b")));

        assert_eq!(drain(&mut r1), vec![json!("a"), json!("b")]);
        assert_eq!(queue.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_dead_buffers() {
        let queue = WorkQueue::new("jobs");
        let (w0, r0) = endpoint();
        queue.register_worker(w0);
        settle().await;
        drop(r0);

        queue.push(WorkItem::new("jobs", json!("a")));
        assert_eq!(queue.worker_count(), 0);
        assert_eq!(queue.buffered(), 1);
    }

    #[tokio::test]
    async fn test_registration_changes_only_affect_later_items() {
        let queue = WorkQueue::new("jobs");
        let (w0, mut r0) = endpoint();
        queue.register_worker(w0);
        settle().await;

        queue.push(WorkItem::new("jobs", json!(0)));
        queue.push(WorkItem::new("jobs", json!(1)));

        let (w1, mut r1) = endpoint();
        queue.register_worker(w1);
        settle().await;

        queue.push(WorkItem::new("jobs", json!(2)));
        queue.push(WorkItem::new("jobs", json!(3)));

        assert_eq!(drain(&mut r0), vec![json!(0), json!(1), json!(3)]);
        assert_eq!(drain(&mut r1), vec![json!(2)]);
    }

    #[test]
    fn test_buffer_limit_drops_oldest() {
        let queue = WorkQueue::with_buffer_limit("jobs", Some(2));
        for i in 0..4 {
            queue.push(WorkItem::new("jobs", json!(i)));
        }
        assert_eq!(queue.buffered(), 2);

        // Without a runtime the flush runs inline.
        let (w0, mut r0) = endpoint();
        queue.register_worker(w0);
        assert_eq!(drain(&mut r0), vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_buffer_limit_ignored_while_flush_pending_with_endpoint() {
        let queue = WorkQueue::with_buffer_limit("jobs", Some(2));
        let (w0, mut r0) = endpoint();
        queue.register_worker(w0);
        for i in 0..5 {
            queue.push(WorkItem::new("jobs", json!(i)));
        }

        settle().await;
        assert_eq!(
            drain(&mut r0),
            vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
        );
        assert_eq!(queue.buffered(), 0);
    }
}
