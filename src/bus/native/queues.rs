//! Native queue facades.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BusCore, Registration};
use crate::broker::{Delivery, HandleId, LocalEndpoint};
use crate::bus::{
    BusError, Payload, PublishQueue, PullQueue, PushQueue, Result, SubscribeQueue, SubscriptionId,
};
use crate::topic::{self, Matcher};

// ============================================================================
// Push
// ============================================================================

/// Producer side of a native work queue.
///
/// Holds no broker state; `close` only stops further publishes.
pub struct NativePushQueue {
    core: Arc<BusCore>,
    name: String,
    closed: AtomicBool,
}

impl NativePushQueue {
    pub(crate) fn new(core: Arc<BusCore>, name: &str) -> Self {
        Self {
            core,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PushQueue for NativePushQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Payload) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.core.check(&self.name)?;
        let queue = self.name.clone();
        self.core
            .submit("push-queue.publish", move |role| role.push(&queue, payload));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Pull
// ============================================================================

/// Consumer side of a native work queue. Pulls from creation until closed.
pub struct NativePullQueue {
    core: Arc<BusCore>,
    name: String,
    handle: HandleId,
    registration: Registration,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Payload>>,
}

impl NativePullQueue {
    pub(crate) fn new(core: Arc<BusCore>, name: &str) -> Self {
        let (sink, inbox) = mpsc::unbounded_channel();
        let handle = HandleId::new_local();
        let registration = Registration::Pull {
            queue: name.to_string(),
            handle,
        };

        core.track(registration.clone());
        let queue = name.to_string();
        let endpoint = LocalEndpoint::new(handle, sink);
        core.submit("pull-queue.start", move |role| {
            role.start_pull(&queue, endpoint)
        });

        Self {
            core,
            name: name.to_string(),
            handle,
            registration,
            inbox: tokio::sync::Mutex::new(inbox),
        }
    }

    /// This facade's endpoint id on the work queue.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    fn release(&self) {
        self.core.release(&self.registration);
    }
}

#[async_trait]
impl PullQueue for NativePullQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self) -> Option<Payload> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for NativePullQueue {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Publish
// ============================================================================

/// Producer side of a native topic exchange.
///
/// Holds no broker state; `close` only stops further publishes.
pub struct NativePublishQueue {
    core: Arc<BusCore>,
    name: String,
    closed: AtomicBool,
}

impl NativePublishQueue {
    pub(crate) fn new(core: Arc<BusCore>, name: &str) -> Self {
        Self {
            core,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PublishQueue for NativePublishQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Payload, topic: Option<&str>) -> Result<()> {
        let topic = topic::normalize(topic)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.core.check(&self.name)?;
        let queue = self.name.clone();
        self.core.submit("publish-queue.publish", move |role| {
            role.publish(&queue, &topic, payload)
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Subscribe
// ============================================================================

/// Consumer side of a native topic exchange.
///
/// Every pattern added with `subscribe` feeds the same inbox.
pub struct NativeSubscribeQueue {
    core: Arc<BusCore>,
    name: String,
    sink: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    closed: AtomicBool,
}

impl NativeSubscribeQueue {
    pub(crate) fn new(core: Arc<BusCore>, name: &str) -> Self {
        let (sink, inbox) = mpsc::unbounded_channel();
        Self {
            core,
            name: name.to_string(),
            sink: Mutex::new(Some(sink)),
            inbox: tokio::sync::Mutex::new(inbox),
            subscriptions: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn registration(&self, id: SubscriptionId) -> Registration {
        Registration::Subscription {
            queue: self.name.clone(),
            id,
        }
    }

    fn release_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in ids {
            self.core.release(&self.registration(id));
        }
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[async_trait]
impl SubscribeQueue for NativeSubscribeQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, pattern: Option<&str>) -> Result<SubscriptionId> {
        let matcher = Matcher::compile(pattern)?;
        self.core.check(&self.name)?;
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BusError::Closed)?;

        let id = SubscriptionId::new();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        self.core.track(self.registration(id));

        let queue = self.name.clone();
        self.core.submit("subscribe-queue.subscribe", move |role| {
            role.subscribe(&queue, id, matcher, sink)
        });
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|own| *own != id);
        self.core.release(&self.registration(id));
        Ok(())
    }

    async fn recv(&self) -> Option<Delivery> {
        self.inbox.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.release_all();
        Ok(())
    }
}

impl Drop for NativeSubscribeQueue {
    fn drop(&mut self) {
        self.release_all();
    }
}
