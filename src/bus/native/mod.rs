//! Native message bus.
//!
//! Facades forward their operations to the process's [`BrokerRole`] through a
//! [`JobSequencer`], so queues can be created and used before `open()`.
//! Topic syntax and missing-broker errors are reported to the caller right
//! away; everything else happens in submission order once the bus is open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::role::BrokerRole;
use super::{
    BusError, HandleId, MessageBus, PublishQueue, PullQueue, PushQueue, Result, SubscribeQueue,
    SubscriptionId,
};
use crate::jobs::{Job, JobSequencer};

mod queues;

pub use queues::{NativePublishQueue, NativePullQueue, NativePushQueue, NativeSubscribeQueue};

#[cfg(test)]
mod tests;

/// Broker-side state created by a facade, released on close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Registration {
    Pull { queue: String, handle: HandleId },
    Subscription { queue: String, id: SubscriptionId },
}

impl Registration {
    fn release(&self, role: &dyn BrokerRole) -> Result<()> {
        match self {
            Self::Pull { queue, handle } => role.stop_pull(queue, *handle),
            Self::Subscription { queue, id } => role.unsubscribe(queue, *id),
        }
    }
}

/// State shared between a connection and its facades.
pub(crate) struct BusCore {
    role: Arc<dyn BrokerRole>,
    jobs: JobSequencer,
    closed: AtomicBool,
    registrations: Mutex<Vec<Registration>>,
}

impl BusCore {
    /// Fail fast on a closed connection or a missing broker.
    pub(crate) fn check(&self, queue: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.role.check(queue)
    }

    /// Queue a broker operation behind everything submitted before it.
    pub(crate) fn submit<F>(&self, name: &str, op: F)
    where
        F: FnOnce(&dyn BrokerRole) -> Result<()> + Send + 'static,
    {
        let role = Arc::clone(&self.role);
        let job = name.to_string();
        self.jobs.push(Job::new(name, move |done| {
            if let Err(e) = op(role.as_ref()) {
                warn!(job = %job, role = %role.label(), error = %e, "Queued operation failed");
            }
            let _ = done.complete();
        }));
    }

    pub(crate) fn track(&self, registration: Registration) {
        self.lock().push(registration);
    }

    /// Release a registration once. Later calls for the same one are no-ops.
    pub(crate) fn release(&self, registration: &Registration) {
        let removed = {
            let mut registrations = self.lock();
            registrations
                .iter()
                .position(|r| r == registration)
                .map(|index| registrations.remove(index))
        };

        if let Some(registration) = removed {
            self.submit("release", move |role| registration.release(role));
        }
    }

    fn release_all(&self) {
        let registrations = std::mem::take(&mut *self.lock());
        for registration in registrations {
            self.submit("release", move |role| registration.release(role));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connection to the native broker.
pub struct NativeBus {
    core: Arc<BusCore>,
}

impl NativeBus {
    /// Create an unopened connection bound to `role`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(role: Arc<dyn BrokerRole>) -> Self {
        Self {
            core: Arc::new(BusCore {
                role,
                jobs: JobSequencer::new(),
                closed: AtomicBool::new(false),
                registrations: Mutex::default(),
            }),
        }
    }

    /// Wait until every operation queued so far has run.
    pub async fn flush(&self) {
        self.core.jobs.idle().await;
    }

    pub fn is_open(&self) -> bool {
        self.core.jobs.is_started() && !self.core.closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for NativeBus {
    fn provider(&self) -> &str {
        "native"
    }

    async fn open(&self) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        info!(role = %self.core.role.label(), pending = self.core.jobs.pending(), "Connection open");
        self.core.jobs.start();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.core.release_all();
        self.core.submit("connection.close", |_| Ok(()));
        // An unopened connection still runs what was queued before closing.
        self.core.jobs.start();
        self.core.jobs.idle().await;

        self.core.closed.store(true, Ordering::SeqCst);
        info!(role = %self.core.role.label(), "Connection closed");
        Ok(())
    }

    async fn create_push_queue(&self, name: &str) -> Result<Box<dyn PushQueue>> {
        self.core.check(name)?;
        debug!(queue = %name, "Push queue created");
        Ok(Box::new(NativePushQueue::new(Arc::clone(&self.core), name)))
    }

    async fn create_pull_queue(&self, name: &str) -> Result<Box<dyn PullQueue>> {
        self.core.check(name)?;
        debug!(queue = %name, "Pull queue created");
        Ok(Box::new(NativePullQueue::new(Arc::clone(&self.core), name)))
    }

    async fn create_publish_queue(&self, name: &str) -> Result<Box<dyn PublishQueue>> {
        self.core.check(name)?;
        debug!(queue = %name, "Publish queue created");
        Ok(Box::new(NativePublishQueue::new(Arc::clone(&self.core), name)))
    }

    async fn create_subscribe_queue(&self, name: &str) -> Result<Box<dyn SubscribeQueue>> {
        self.core.check(name)?;
        debug!(queue = %name, "Subscribe queue created");
        Ok(Box::new(NativeSubscribeQueue::new(Arc::clone(&self.core), name)))
    }
}
