//! The coordinating broker.
//!
//! The coordinator owns every named queue. Workers never touch queue state
//! directly: they send [`WireMessage`]s over their link and the coordinator
//! routes them. At most one coordinator may be live in a process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::WireMessage;
use super::work_queue::{Endpoint, HandleId, WorkItem};
use super::{QueueRegistry, TopicQueue, WorkQueue};
use crate::bus::role::CoordinatorRole;
use crate::bus::{BusError, Result};
use crate::cluster::{WorkerEvent, WorkerId, WorkerLink, WorkerRegistry};
use crate::config::NativeConfig;

static COORDINATOR_LIVE: AtomicBool = AtomicBool::new(false);

/// Held by the live coordinator; released on drop.
#[derive(Debug)]
struct InstanceGuard;

impl InstanceGuard {
    fn acquire() -> Result<Self> {
        COORDINATOR_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self)
            .map_err(|_| BusError::AlreadyInitialized)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        COORDINATOR_LIVE.store(false, Ordering::SeqCst);
    }
}

/// Endpoint delivering work items over a worker's link.
#[derive(Debug, Clone)]
struct RemoteEndpoint {
    link: WorkerLink,
}

impl Endpoint for RemoteEndpoint {
    fn id(&self) -> HandleId {
        HandleId::Worker(self.link.id())
    }

    fn deliver(&self, item: WorkItem) -> std::result::Result<(), WorkItem> {
        let WorkItem { queue, payload } = item;
        self.link
            .send(WireMessage::PushDelivery {
                queue_name: queue,
                payload,
            })
            .map_err(|rejected| match rejected {
                WireMessage::PushDelivery {
                    queue_name,
                    payload,
                } => WorkItem::new(queue_name, payload),
                _ => unreachable!("link hands back the message it was given"),
            })
    }
}

/// Shared coordinator state. Background tasks hold it weakly.
#[derive(Debug)]
pub(crate) struct CoordinatorInner {
    pub(crate) queues: QueueRegistry,
    workers: WorkerRegistry,
    readers: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
}

impl CoordinatorInner {
    fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::Joined {
                id,
                link,
                mut inbound,
            } => {
                info!(worker = %id, "Worker joined");
                self.workers.insert(link);

                let inner = Arc::downgrade(self);
                let reader = tokio::spawn(async move {
                    while let Some(message) = inbound.recv().await {
                        let Some(inner) = inner.upgrade() else {
                            return;
                        };
                        inner.route(id, message);
                    }
                    if let Some(inner) = inner.upgrade() {
                        inner.worker_left(id);
                    }
                });

                if let Some(previous) = self.lock_readers().insert(id, reader) {
                    previous.abort();
                }
            }
            WorkerEvent::Left { id } => self.worker_left(id),
        }
    }

    fn worker_left(&self, id: WorkerId) {
        if let Some(reader) = self.lock_readers().remove(&id) {
            reader.abort();
        }
        if self.workers.remove(id).is_none() {
            return;
        }

        let handle = HandleId::Worker(id);
        let purged: usize = self
            .queues
            .work_queues()
            .iter()
            .map(|queue| queue.purge_worker(handle))
            .sum();
        info!(worker = %id, purged, "Worker left");
    }

    pub(crate) fn route(&self, from: WorkerId, message: WireMessage) {
        debug!(worker = %from, kind = message.kind(), queue = ?message.queue_name(), "Routing");

        match message {
            WireMessage::StartPull { queue_name } => match self.workers.get(from) {
                Some(link) => self
                    .queues
                    .work_queue(&queue_name)
                    .register_worker(Arc::new(RemoteEndpoint { link })),
                None => debug!(worker = %from, queue = %queue_name, "Ignoring start-pull from departed worker"),
            },
            WireMessage::StopPull { queue_name } => {
                self.queues
                    .work_queue(&queue_name)
                    .unregister_worker(HandleId::Worker(from));
            }
            WireMessage::PushRequest {
                queue_name,
                payload,
            } => {
                let queue = self.queues.work_queue(&queue_name);
                queue.push(WorkItem::new(queue_name, payload));
            }
            WireMessage::PublishRequest {
                queue_name,
                topic,
                payload,
            } => {
                let queue = self.queues.topic_queue(&queue_name);
                if let Err(e) = queue.publish(Some(&topic), payload) {
                    warn!(worker = %from, queue = %queue_name, error = %e, "Dropping publish");
                }
            }
            other => debug!(worker = %from, kind = other.kind(), "Ignoring message"),
        }
    }

    fn lock_readers(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerId, JoinHandle<()>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The single queue-owning broker of a process.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    _guard: InstanceGuard,
}

impl Coordinator {
    /// Create the coordinator with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(&NativeConfig::default())
    }

    /// Create the coordinator.
    ///
    /// Fails with [`BusError::AlreadyInitialized`] while another is live.
    pub fn with_config(config: &NativeConfig) -> Result<Self> {
        let guard = InstanceGuard::acquire()?;
        let workers = WorkerRegistry::default();

        info!(
            buffer_limit = ?config.work_queue_buffer_limit,
            "Coordinator started"
        );

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                queues: QueueRegistry::coordinator(
                    workers.clone(),
                    config.work_queue_buffer_limit,
                ),
                workers,
                readers: Mutex::default(),
            }),
            event_loop: Mutex::default(),
            _guard: guard,
        })
    }

    /// Consume worker lifecycle events from a supervisor.
    pub fn attach(&self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle_event(event);
            }
            debug!("Worker event stream ended");
        });

        let previous = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Apply one lifecycle event directly.
    pub fn handle_event(&self, event: WorkerEvent) {
        self.inner.handle_event(event);
    }

    /// Route one message as if it arrived from worker `from`.
    pub fn route(&self, from: WorkerId, message: WireMessage) {
        self.inner.route(from, message);
    }

    pub fn work_queue(&self, name: &str) -> WorkQueue {
        self.inner.queues.work_queue(name)
    }

    pub fn topic_queue(&self, name: &str) -> TopicQueue {
        self.inner.queues.topic_queue(name)
    }

    /// Capability for coordinator-side facades.
    pub fn role(&self) -> CoordinatorRole {
        CoordinatorRole::new(Arc::downgrade(&self.inner))
    }

    /// Currently connected workers.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.inner.workers.ids()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for (_, reader) in self.inner.lock_readers().drain() {
            reader.abort();
        }
        info!("Coordinator stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.inner.workers.ids())
            .finish()
    }
}
