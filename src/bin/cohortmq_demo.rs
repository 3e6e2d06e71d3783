//! cohortmq-demo: native broker walkthrough
//!
//! Started normally, the process becomes the coordinator. It re-executes this
//! binary as `demo.workers` worker processes (each with COHORTMQ_WORKER_ID
//! set), pushes `demo.jobs` numbers onto the "jobs" work queue and collects
//! the squares the workers publish on the "results" exchange.
//!
//! ## Configuration
//! - `--config <path>`: optional YAML file (see `cohortmq.example.yaml`)
//! - COHORTMQ_LOG: log filter (default "info")
//! - COHORTMQ__DEMO__WORKERS / COHORTMQ__DEMO__JOBS: demo sizing

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use cohortmq::broker::Coordinator;
use cohortmq::bus;
use cohortmq::bus::role::WorkerRole;
use cohortmq::cluster::{ProcessCluster, ProcessRole, WorkerId};
use cohortmq::config::Config;

const JOBS_QUEUE: &str = "jobs";
const RESULTS_EXCHANGE: &str = "results";
const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct SquareJob {
    n: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SquareResult {
    n: u64,
    square: u64,
    worker: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cohortmq::utils::bootstrap::init_tracing();

    let config_path = cohortmq::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match ProcessRole::detect()? {
        ProcessRole::Coordinator => run_coordinator(config).await,
        ProcessRole::Worker(id) => run_worker(id, config).await,
    }
}

async fn run_coordinator(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        workers = config.demo.workers,
        jobs = config.demo.jobs,
        "Starting cohortmq-demo coordinator"
    );

    let coordinator = Coordinator::with_config(&config.native)?;
    let (cluster, events) = ProcessCluster::new(config.native.max_frame_bytes);
    coordinator.attach(events);

    let bus = bus::create(&config.provider, Arc::new(coordinator.role()))?;
    let results = bus.create_subscribe_queue(RESULTS_EXCHANGE).await?;
    results.subscribe(Some(RESULTS_EXCHANGE)).await?;
    let jobs = bus.create_push_queue(JOBS_QUEUE).await?;
    bus.open().await?;

    // Workers are copies of this binary with the same arguments.
    let mut command = vec![std::env::current_exe()?.to_string_lossy().into_owned()];
    command.extend(std::env::args().skip(1));
    for _ in 0..config.demo.workers {
        cluster.spawn(&command)?;
    }

    for n in 0..config.demo.jobs as u64 {
        jobs.publish(bus::encode(&SquareJob { n })?).await?;
    }

    let mut received = 0;
    while received < config.demo.jobs {
        match tokio::time::timeout(RESULT_TIMEOUT, results.recv()).await {
            Ok(Some(delivery)) => {
                let result: SquareResult = delivery.decode()?;
                info!(
                    topic = %delivery.topic,
                    n = result.n,
                    square = result.square,
                    worker = result.worker,
                    "Result received"
                );
                received += 1;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(received, expected = config.demo.jobs, "Timed out waiting for results");
                break;
            }
        }
    }

    bus.close().await?;
    for id in cluster.worker_ids() {
        cluster.stop_worker(id)?;
    }
    info!(received, "cohortmq-demo finished");
    Ok(())
}

async fn run_worker(id: WorkerId, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let role = WorkerRole::from_stdio(&config.native)?;
    let bus = bus::create(&config.provider, Arc::new(role.clone()))?;
    let jobs = bus.create_pull_queue(JOBS_QUEUE).await?;
    let results = bus.create_publish_queue(RESULTS_EXCHANGE).await?;
    bus.open().await?;

    let topic = format!("{RESULTS_EXCHANGE}.w{}", id.0);
    info!(worker = %id, "Worker pulling jobs");

    loop {
        tokio::select! {
            item = jobs.recv() => {
                let Some(payload) = item else { break };
                let job: SquareJob = bus::decode(payload)?;
                let result = SquareResult {
                    n: job.n,
                    square: job.n * job.n,
                    worker: id.0,
                };
                results.publish(bus::encode(&result)?, Some(&topic)).await?;
            }
            _ = role.disconnected() => {
                info!(worker = %id, "Coordinator went away");
                break;
            }
        }
    }

    bus.close().await?;
    Ok(())
}
