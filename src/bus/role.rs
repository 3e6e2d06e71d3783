//! Broker roles.
//!
//! A process is either the coordinator or one of its workers. The role is
//! picked once at startup and injected into the native bus, which forwards
//! every queue operation to it.

use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BusError, Payload, Result};
use crate::broker::coordinator::CoordinatorInner;
use crate::broker::{
    DeliverySink, HandleId, LocalEndpoint, QueueRegistry, SubscriptionId, WireMessage, WorkItem,
};
use crate::cluster::process::stdio_channels;
use crate::cluster::{ProcessRole, WorkerId};
use crate::config::NativeConfig;
use crate::topic::Matcher;

/// Queue operations as seen by one side of the broker.
///
/// Topics and patterns arrive already validated.
pub trait BrokerRole: Send + Sync {
    /// Short label for logging.
    fn label(&self) -> String;

    /// Fail with [`BusError::NoUnderlyingQueue`] when no broker stands behind `queue`.
    fn check(&self, queue: &str) -> Result<()>;

    fn push(&self, queue: &str, payload: Payload) -> Result<()>;

    fn start_pull(&self, queue: &str, endpoint: LocalEndpoint) -> Result<()>;

    fn stop_pull(&self, queue: &str, handle: HandleId) -> Result<()>;

    fn publish(&self, queue: &str, topic: &str, payload: Payload) -> Result<()>;

    fn subscribe(
        &self,
        queue: &str,
        id: SubscriptionId,
        matcher: Matcher,
        sink: DeliverySink,
    ) -> Result<()>;

    fn unsubscribe(&self, queue: &str, id: SubscriptionId) -> Result<()>;
}

// ============================================================================
// Coordinator
// ============================================================================

/// Talks directly to the coordinator's queues.
///
/// Holds the coordinator weakly; once it is dropped every operation fails.
#[derive(Debug, Clone)]
pub struct CoordinatorRole {
    inner: Weak<CoordinatorInner>,
}

impl CoordinatorRole {
    pub(crate) fn new(inner: Weak<CoordinatorInner>) -> Self {
        Self { inner }
    }

    fn coordinator(&self, queue: &str) -> Result<Arc<CoordinatorInner>> {
        self.inner.upgrade().ok_or_else(|| BusError::NoUnderlyingQueue {
            name: queue.to_string(),
        })
    }
}

impl BrokerRole for CoordinatorRole {
    fn label(&self) -> String {
        "coordinator".to_string()
    }

    fn check(&self, queue: &str) -> Result<()> {
        self.coordinator(queue).map(|_| ())
    }

    fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        self.coordinator(queue)?
            .queues
            .work_queue(queue)
            .push(WorkItem::new(queue, payload));
        Ok(())
    }

    fn start_pull(&self, queue: &str, endpoint: LocalEndpoint) -> Result<()> {
        self.coordinator(queue)?
            .queues
            .work_queue(queue)
            .register_worker(Arc::new(endpoint));
        Ok(())
    }

    fn stop_pull(&self, queue: &str, handle: HandleId) -> Result<()> {
        self.coordinator(queue)?
            .queues
            .work_queue(queue)
            .unregister_worker(handle);
        Ok(())
    }

    fn publish(&self, queue: &str, topic: &str, payload: Payload) -> Result<()> {
        self.coordinator(queue)?
            .queues
            .topic_queue(queue)
            .publish(Some(topic), payload)
    }

    fn subscribe(
        &self,
        queue: &str,
        id: SubscriptionId,
        matcher: Matcher,
        sink: DeliverySink,
    ) -> Result<()> {
        self.coordinator(queue)?
            .queues
            .topic_queue(queue)
            .insert(id, matcher, sink);
        Ok(())
    }

    fn unsubscribe(&self, queue: &str, id: SubscriptionId) -> Result<()> {
        self.coordinator(queue)?.queues.topic_queue(queue).unsubscribe(id);
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug)]
struct WorkerInner {
    id: WorkerId,
    outbound: mpsc::UnboundedSender<WireMessage>,
    queues: QueueRegistry,
    connected: watch::Receiver<bool>,
    router: OnceLock<JoinHandle<()>>,
}

impl WorkerInner {
    fn send(&self, message: WireMessage) -> Result<()> {
        self.outbound.send(message).map_err(|rejected| {
            BusError::Disconnected(format!(
                "{} could not send {}",
                self.id,
                rejected.0.kind()
            ))
        })
    }

    fn dispatch(&self, message: WireMessage) {
        match message {
            WireMessage::PushDelivery {
                queue_name,
                payload,
            } => {
                let queue = self.queues.work_queue(&queue_name);
                queue.push(WorkItem::new(queue_name, payload));
            }
            WireMessage::PublishDelivery {
                queue_name,
                topic,
                payload,
            } => {
                if let Err(e) = self
                    .queues
                    .topic_queue(&queue_name)
                    .deliver_local(&topic, payload)
                {
                    warn!(worker = %self.id, queue = %queue_name, error = %e, "Dropping delivery");
                }
            }
            other => debug!(worker = %self.id, kind = other.kind(), "Ignoring message"),
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if let Some(router) = self.router.get() {
            router.abort();
        }
    }
}

/// Forwards queue operations to the coordinator over the worker's link.
///
/// Deliveries coming back are routed to local pull facades (round-robin per
/// queue) and to local subscriptions whose pattern matches.
#[derive(Debug, Clone)]
pub struct WorkerRole {
    inner: Arc<WorkerInner>,
}

impl WorkerRole {
    /// Build a worker role over an established link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: WorkerId,
        outbound: mpsc::UnboundedSender<WireMessage>,
        inbound: mpsc::UnboundedReceiver<WireMessage>,
        buffer_limit: Option<usize>,
    ) -> Self {
        let (connected_tx, connected) = watch::channel(true);

        let inner = Arc::new(WorkerInner {
            id,
            outbound,
            queues: QueueRegistry::local(buffer_limit),
            connected,
            router: OnceLock::new(),
        });
        let router = tokio::spawn(route_inbound(Arc::downgrade(&inner), inbound, connected_tx));
        let _ = inner.router.set(router);

        info!(worker = %id, "Worker role ready");
        Self { inner }
    }

    /// Build the role of a worker process spawned by a `ProcessCluster`.
    pub fn from_stdio(config: &NativeConfig) -> Result<Self> {
        match ProcessRole::detect()? {
            ProcessRole::Worker(id) => {
                let (outbound, inbound) = stdio_channels(config.max_frame_bytes);
                Ok(Self::new(
                    id,
                    outbound,
                    inbound,
                    config.work_queue_buffer_limit,
                ))
            }
            ProcessRole::Coordinator => Err(BusError::Config(
                "not a worker process: worker id is not set".to_string(),
            )),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolves once the link from the coordinator is gone.
    pub async fn disconnected(&self) {
        let mut connected = self.inner.connected.clone();
        let _ = connected.wait_for(|up| !*up).await;
    }
}

async fn route_inbound(
    inner: Weak<WorkerInner>,
    mut inbound: mpsc::UnboundedReceiver<WireMessage>,
    connected: watch::Sender<bool>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(message);
    }
    info!("Coordinator link closed");
    connected.send_replace(false);
}

impl BrokerRole for WorkerRole {
    fn label(&self) -> String {
        self.inner.id.to_string()
    }

    fn check(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        self.inner.send(WireMessage::PushRequest {
            queue_name: queue.to_string(),
            payload,
        })
    }

    fn start_pull(&self, queue: &str, endpoint: LocalEndpoint) -> Result<()> {
        self.inner
            .queues
            .work_queue(queue)
            .register_worker(Arc::new(endpoint));
        self.inner.send(WireMessage::StartPull {
            queue_name: queue.to_string(),
        })
    }

    fn stop_pull(&self, queue: &str, handle: HandleId) -> Result<()> {
        self.inner.queues.work_queue(queue).unregister_worker(handle);
        self.inner.send(WireMessage::StopPull {
            queue_name: queue.to_string(),
        })
    }

    fn publish(&self, queue: &str, topic: &str, payload: Payload) -> Result<()> {
        self.inner.send(WireMessage::PublishRequest {
            queue_name: queue.to_string(),
            topic: topic.to_string(),
            payload,
        })
    }

    fn subscribe(
        &self,
        queue: &str,
        id: SubscriptionId,
        matcher: Matcher,
        sink: DeliverySink,
    ) -> Result<()> {
        self.inner.queues.topic_queue(queue).insert(id, matcher, sink);
        Ok(())
    }

    fn unsubscribe(&self, queue: &str, id: SubscriptionId) -> Result<()> {
        self.inner.queues.topic_queue(queue).unsubscribe(id);
        Ok(())
    }
}
