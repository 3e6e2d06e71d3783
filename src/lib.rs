//! cohortmq - push/pull and publish/subscribe messaging
//!
//! A uniform work-queue and topic API with a native broker: one coordinating
//! process owns queue state and the worker processes it supervises reach it
//! by message passing.

pub mod broker;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod jobs;
pub mod topic;
pub mod utils;

pub use broker::Coordinator;
pub use bus::{BusError, MessageBus, Payload, Result};
pub use cluster::{LocalCluster, ProcessCluster, ProcessRole, WorkerId};
pub use config::Config;
