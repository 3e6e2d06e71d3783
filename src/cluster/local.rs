//! In-memory worker supervision.
//!
//! Workers are ordinary tasks in this process connected to the coordinator by
//! channels. Useful for tests and for embedding several workers in one binary.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::info;

use super::{WorkerEvent, WorkerId, WorkerLink};
use crate::bus::role::WorkerRole;
use crate::bus::{BusError, Result};

/// Supervisor for in-process workers.
#[derive(Debug)]
pub struct LocalCluster {
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_id: AtomicU64,
    buffer_limit: Option<usize>,
}

impl LocalCluster {
    /// Create a cluster and the event stream to hand to the coordinator.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        Self::with_buffer_limit(None)
    }

    /// Like [`new`](Self::new), with a buffer limit for workers' local work queues.
    pub fn with_buffer_limit(limit: Option<usize>) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let cluster = Self {
            events,
            next_id: AtomicU64::new(1),
            buffer_limit: limit,
        };
        (cluster, rx)
    }

    /// Start a worker and announce it to the coordinator.
    pub fn spawn_worker(&self) -> Result<WorkerRole> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (to_worker, from_coordinator) = mpsc::unbounded_channel();
        let (to_coordinator, inbound) = mpsc::unbounded_channel();

        self.events
            .send(WorkerEvent::Joined {
                id,
                link: WorkerLink::new(id, to_worker),
                inbound,
            })
            .map_err(|_| BusError::Disconnected("coordinator event loop is gone".to_string()))?;

        info!(worker = %id, "Local worker spawned");
        Ok(WorkerRole::new(
            id,
            to_coordinator,
            from_coordinator,
            self.buffer_limit,
        ))
    }

    /// Announce that a worker exited.
    pub fn stop_worker(&self, id: WorkerId) -> Result<()> {
        info!(worker = %id, "Local worker stopped");
        self.events
            .send(WorkerEvent::Left { id })
            .map_err(|_| BusError::Disconnected("coordinator event loop is gone".to_string()))
    }
}
