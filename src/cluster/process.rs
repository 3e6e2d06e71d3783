//! OS child-process supervision.
//!
//! Each worker is a child process started with [`WORKER_ID_ENV_VAR`] set. The
//! coordinator talks to it over framed stdin/stdout; the child's stderr is
//! inherited so its logs stay visible.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::codec::{spawn_reader, spawn_writer};
use super::{WorkerEvent, WorkerId, WorkerLink, WORKER_ID_ENV_VAR};
use crate::broker::WireMessage;
use crate::bus::{BusError, Result};

type Supervisors = Arc<Mutex<HashMap<WorkerId, JoinHandle<()>>>>;

/// Supervisor for worker child processes.
///
/// Exactly one `Left` is emitted per worker, whether it exits on its own or
/// is stopped.
pub struct ProcessCluster {
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
    supervisors: Supervisors,
}

impl ProcessCluster {
    /// Create a cluster and the event stream to hand to the coordinator.
    pub fn new(max_frame_bytes: usize) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let cluster = Self {
            events,
            next_id: AtomicU64::new(1),
            max_frame_bytes,
            supervisors: Supervisors::default(),
        };
        (cluster, rx)
    }

    /// Spawn a worker process.
    ///
    /// `command` is the executable followed by its arguments; no shell is involved.
    pub fn spawn(&self, command: &[String]) -> Result<WorkerId> {
        let Some((executable, args)) = command.split_first() else {
            return Err(BusError::Config("Command array cannot be empty".to_string()));
        };

        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(worker = %id, executable = %executable, ?args, "Spawning worker process");

        let mut child = Command::new(executable)
            .args(args)
            .env(WORKER_ID_ENV_VAR, id.0.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BusError::Config("worker stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusError::Config("worker stdout was not captured".to_string()))?;

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let writer = spawn_writer(stdin, link_rx);
        spawn_reader(stdout, self.max_frame_bytes, inbound_tx);

        self.events
            .send(WorkerEvent::Joined {
                id,
                link: WorkerLink::new(id, link_tx),
                inbound,
            })
            .map_err(|_| BusError::Disconnected("coordinator event loop is gone".to_string()))?;

        let events = self.events.clone();
        let supervisors = Arc::clone(&self.supervisors);
        // Held until the handle is stored, so the supervisor cannot race its own entry.
        let mut running = lock(&self.supervisors);
        let supervisor = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(worker = %id, %status, "Worker process exited"),
                Err(e) => warn!(worker = %id, error = %e, "Failed to wait for worker process"),
            }
            writer.abort();
            if lock(&supervisors).remove(&id).is_some() {
                let _ = events.send(WorkerEvent::Left { id });
            }
        });
        running.insert(id, supervisor);
        Ok(id)
    }

    /// Kill a worker process and announce its departure.
    ///
    /// A worker that already exited was announced by its supervisor; stopping
    /// it again is a no-op.
    pub fn stop_worker(&self, id: WorkerId) -> Result<()> {
        let Some(supervisor) = lock(&self.supervisors).remove(&id) else {
            return Ok(());
        };
        // Dropping the child inside the aborted task kills it.
        supervisor.abort();
        info!(worker = %id, "Worker process stopped");
        self.events
            .send(WorkerEvent::Left { id })
            .map_err(|_| BusError::Disconnected("coordinator event loop is gone".to_string()))
    }

    /// Ids of workers that are still running.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = lock(&self.supervisors).keys().copied().collect();
        ids.sort();
        ids
    }
}

fn lock(
    supervisors: &Mutex<HashMap<WorkerId, JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, HashMap<WorkerId, JoinHandle<()>>> {
    supervisors.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for ProcessCluster {
    fn drop(&mut self) {
        for (_, supervisor) in lock(&self.supervisors).drain() {
            supervisor.abort();
        }
    }
}

/// Worker-side channels over this process's stdin/stdout.
///
/// Returns the sender for messages to the coordinator and the receiver for
/// messages from it.
pub fn stdio_channels(
    max_frame_bytes: usize,
) -> (
    mpsc::UnboundedSender<WireMessage>,
    mpsc::UnboundedReceiver<WireMessage>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    spawn_writer(tokio::io::stdout(), outbound_rx);
    spawn_reader(tokio::io::stdin(), max_frame_bytes, inbound_tx);
    (outbound_tx, inbound_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::codec::DEFAULT_MAX_FRAME_BYTES;

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let (cluster, _events) = ProcessCluster::new(DEFAULT_MAX_FRAME_BYTES);
        let err = cluster.spawn(&[]).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_executable_is_io_error() {
        let (cluster, _events) = ProcessCluster::new(DEFAULT_MAX_FRAME_BYTES);
        let err = cluster
            .spawn(&["/nonexistent/cohortmq-worker".to_string()])
            .unwrap_err();
        assert!(matches!(err, BusError::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_emits_left() {
        let (cluster, mut events) = ProcessCluster::new(DEFAULT_MAX_FRAME_BYTES);
        let id = cluster.spawn(&["true".to_string()]).unwrap();

        match events.recv().await {
            Some(WorkerEvent::Joined { id: joined, .. }) => assert_eq!(joined, id),
            other => panic!("expected Joined, got {other:?}"),
        }
        match events.recv().await {
            Some(WorkerEvent::Left { id: left }) => assert_eq!(left, id),
            other => panic!("expected Left, got {other:?}"),
        }
        assert!(cluster.worker_ids().is_empty());

        // Already announced; no second Left.
        cluster.stop_worker(id).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_worker_emits_single_left() {
        let (cluster, mut events) = ProcessCluster::new(DEFAULT_MAX_FRAME_BYTES);
        let id = cluster
            .spawn(&["sleep".to_string(), "30".to_string()])
            .unwrap();
        assert_eq!(cluster.worker_ids(), vec![id]);
        assert!(matches!(events.recv().await, Some(WorkerEvent::Joined { .. })));

        cluster.stop_worker(id).unwrap();
        cluster.stop_worker(id).unwrap();
        assert!(cluster.worker_ids().is_empty());

        match events.recv().await {
            Some(WorkerEvent::Left { id: left }) => assert_eq!(left, id),
            other => panic!("expected Left, got {other:?}"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
