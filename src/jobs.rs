//! Ordered deferred job runner.
//!
//! A [`JobSequencer`] holds every job pushed to it until [`JobSequencer::start`]
//! is called, then runs them strictly one at a time in submission order. A job
//! is a named function receiving a [`JobDone`] signal; the next job starts only
//! after the previous one signaled completion.
//!
//! Connections use this to accept queue operations before their transport is
//! ready without reordering or dropping any of them.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Result};

type JobFn = Box<dyn FnOnce(JobDone) + Send + 'static>;

/// A named unit of deferred work.
pub struct Job {
    name: Arc<str>,
    run: JobFn,
}

impl Job {
    /// Create a job from a function that signals completion through `JobDone`.
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(JobDone) + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            run: Box::new(run),
        }
    }

    /// Create a job that completes when `future` resolves.
    pub fn from_future<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::new(name, move |done| {
            tokio::spawn(async move {
                future.await;
                let _ = done.complete();
            });
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

/// Completion signal handed to a running job.
///
/// Cloneable so it can be moved into callbacks. Only the first
/// [`complete`](JobDone::complete) counts.
#[derive(Clone)]
pub struct JobDone {
    job: Arc<str>,
    signal: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl JobDone {
    fn new(job: Arc<str>, signal: oneshot::Sender<()>) -> Self {
        Self {
            job,
            signal: Arc::new(Mutex::new(Some(signal))),
        }
    }

    /// Signal that the job finished.
    pub fn complete(&self) -> Result<()> {
        let signal = self
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match signal {
            Some(signal) => {
                // The driver only goes away with the sequencer itself.
                let _ = signal.send(());
                Ok(())
            }
            None => {
                warn!(job = %self.job, "Job signaled completion more than once");
                Err(BusError::DoubleCompletion {
                    job: self.job.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for JobDone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDone").field("job", &self.job).finish()
    }
}

/// FIFO job runner gated on an explicit start.
pub struct JobSequencer {
    queue: mpsc::UnboundedSender<Job>,
    started: watch::Sender<bool>,
    pending: Arc<watch::Sender<usize>>,
    driver: JoinHandle<()>,
}

impl JobSequencer {
    /// Create an unstarted sequencer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let (started, gate) = watch::channel(false);
        let pending = Arc::new(watch::channel(0usize).0);

        let driver = tokio::spawn(drive(jobs, gate, Arc::clone(&pending)));

        Self {
            queue,
            started,
            pending,
            driver,
        }
    }

    /// Append a job. It runs after every job pushed before it.
    pub fn push(&self, job: Job) {
        debug!(job = %job.name, "Job queued");
        self.pending.send_modify(|count| *count += 1);
        if let Err(rejected) = self.queue.send(job) {
            // Driver gone: nothing will ever run it.
            self.pending.send_modify(|count| *count -= 1);
            error!(job = %rejected.0.name, "Job sequencer is not running, job dropped");
        }
    }

    /// Release queued jobs. Calling this again is a no-op.
    pub fn start(&self) {
        if !self.started.send_replace(true) {
            info!(pending = self.pending(), "Job sequencer started");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Jobs pushed but not yet completed, including the running one.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every job pushed so far has completed.
    ///
    /// Never resolves while jobs are pending on an unstarted sequencer.
    pub async fn idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }
}

impl Default for JobSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobSequencer {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut gate: watch::Receiver<bool>,
    pending: Arc<watch::Sender<usize>>,
) {
    if gate.wait_for(|started| *started).await.is_err() {
        return;
    }

    while let Some(job) = jobs.recv().await {
        let Job { name, run } = job;
        let (signal, completed) = oneshot::channel();

        debug!(job = %name, "Job started");
        run(JobDone::new(Arc::clone(&name), signal));

        match completed.await {
            Ok(()) => debug!(job = %name, "Job completed"),
            Err(_) => error!(
                job = %name,
                "Job dropped its completion signal without completing, moving on"
            ),
        }
        pending.send_modify(|count| *count -= 1);
    }
}
