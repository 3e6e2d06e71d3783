//! Worker supervision boundary.
//!
//! A supervisor (in-memory [`LocalCluster`] or OS-process [`ProcessCluster`])
//! reports workers joining and leaving as [`WorkerEvent`]s. The coordinator
//! consumes those events; it never spawns or kills workers itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::WireMessage;
use crate::bus::{BusError, Result};

pub mod codec;
pub mod local;
pub mod process;

pub use local::LocalCluster;
pub use process::ProcessCluster;

/// Environment variable carrying the worker id of a spawned worker process.
pub const WORKER_ID_ENV_VAR: &str = "COHORTMQ_WORKER_ID";

/// Identifies a worker within one coordinator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Coordinator → worker sender.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl WorkerLink {
    pub fn new(id: WorkerId, tx: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Send a message, handing it back if the worker is gone.
    pub fn send(&self, message: WireMessage) -> std::result::Result<(), WireMessage> {
        self.tx.send(message).map_err(|rejected| rejected.0)
    }
}

/// Worker lifecycle notification.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A worker is up. `inbound` carries its messages to the coordinator.
    Joined {
        id: WorkerId,
        link: WorkerLink,
        inbound: mpsc::UnboundedReceiver<WireMessage>,
    },
    /// A worker exited.
    Left { id: WorkerId },
}

/// Links to every connected worker.
///
/// Cloning yields another handle to the same set.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    links: Arc<RwLock<BTreeMap<WorkerId, WorkerLink>>>,
}

impl WorkerRegistry {
    pub fn insert(&self, link: WorkerLink) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(link.id(), link);
    }

    pub fn remove(&self, id: WorkerId) -> Option<WorkerLink> {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerLink> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `message` to every worker. Returns how many accepted it.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let mut sent = 0;
        for link in links.values() {
            match link.send(message.clone()) {
                Ok(()) => sent += 1,
                // Departure is reported separately.
                Err(_) => debug!(worker = %link.id(), kind = message.kind(), "Worker link closed"),
            }
        }
        sent
    }
}

/// Which side of the broker this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Coordinator,
    Worker(WorkerId),
}

impl ProcessRole {
    /// Read [`WORKER_ID_ENV_VAR`]: set means worker, unset means coordinator.
    pub fn detect() -> Result<Self> {
        match std::env::var(WORKER_ID_ENV_VAR) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::Coordinator),
        }
    }

    fn parse(value: &str) -> Result<Self> {
        value
            .trim()
            .parse::<u64>()
            .map(|id| Self::Worker(WorkerId(id)))
            .map_err(|e| BusError::Config(format!("{WORKER_ID_ENV_VAR}={value:?}: {e}")))
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn link(id: u64) -> (WorkerLink, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerLink::new(WorkerId(id), tx), rx)
    }

    #[test]
    fn test_registry_broadcast_skips_closed_links() {
        let registry = WorkerRegistry::default();
        let (a, mut a_rx) = link(1);
        let (b, b_rx) = link(2);
        registry.insert(a);
        registry.insert(b);
        drop(b_rx);

        let message = WireMessage::StartPull {
            queue_name: "jobs".to_string(),
        };
        assert_eq!(registry.broadcast(&message), 1);
        assert_eq!(a_rx.try_recv().unwrap(), message);
    }

    #[test]
    fn test_registry_membership() {
        let registry = WorkerRegistry::default();
        assert!(registry.is_empty());

        registry.insert(link(2).0);
        registry.insert(link(1).0);
        assert_eq!(registry.ids(), vec![WorkerId(1), WorkerId(2)]);

        assert!(registry.remove(WorkerId(1)).is_some());
        assert!(registry.remove(WorkerId(1)).is_none());
        assert!(registry.get(WorkerId(2)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }

    #[test]
    fn test_process_role_parse() {
        assert_eq!(
            ProcessRole::parse("7").unwrap(),
            ProcessRole::Worker(WorkerId(7))
        );
        assert!(ProcessRole::parse("seven").is_err());
    }

    #[test]
    #[serial(worker_env)]
    fn test_process_role_detect() {
        std::env::remove_var(WORKER_ID_ENV_VAR);
        assert_eq!(ProcessRole::detect().unwrap(), ProcessRole::Coordinator);

        std::env::set_var(WORKER_ID_ENV_VAR, "4");
        let role = ProcessRole::detect().unwrap();
        std::env::remove_var(WORKER_ID_ENV_VAR);

        assert!(role.is_worker());
        assert_eq!(role, ProcessRole::Worker(WorkerId(4)));
    }
}
