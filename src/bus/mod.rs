//! Message bus facades.
//!
//! This module contains:
//! - `MessageBus` trait: a connection that creates queue facades
//! - `PushQueue` / `PullQueue`: point-to-point work queues (round-robin)
//! - `PublishQueue` / `SubscribeQueue`: topic fan-out with pattern filters
//! - `BrokerRole`: the coordinator/worker capability injected into the native bus
//! - Provider selection and the bus factory
//!
//! Application code written against these traits is portable across the
//! native coordinator/worker broker and any external-broker adapter.
//!
//! Delivery semantics differ on purpose: a work queue with no pulling worker
//! buffers messages until one attaches, while a topic queue with no matching
//! subscriber drops them.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::broker::{Delivery, HandleId, SubscriptionId};

#[cfg(feature = "native")]
pub mod native;
pub mod provider;
pub mod role;

#[cfg(feature = "native")]
pub use native::{NativeBus, NativePublishQueue, NativePullQueue, NativePushQueue, NativeSubscribeQueue};
pub use provider::{create, Provider, ProviderOptions};
pub use role::BrokerRole;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid topic: {topic:?}")]
    InvalidTopic { topic: String },

    #[error("No underlying queue was created for '{name}'")]
    NoUnderlyingQueue { name: String },

    #[error("Job '{job}' signaled completion more than once")]
    DoubleCompletion { job: String },

    #[error("A coordinator is already running in this process")]
    AlreadyInitialized,

    #[error("Connection is closed")]
    Closed,

    #[error("Disconnected from coordinator: {0}")]
    Disconnected(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Options must specify the provider")]
    MissingProvider,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Payloads
// ============================================================================

/// Opaque message body.
///
/// Strings, numbers, objects and arrays all survive the trip between a worker
/// and the coordinator unchanged.
pub type Payload = serde_json::Value;

/// Encode any serializable value as a payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Payload> {
    Ok(serde_json::to_value(value)?)
}

/// Decode a payload into a concrete type.
pub fn decode<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

// ============================================================================
// Traits
// ============================================================================

/// A connection to a messaging backend.
///
/// Queues may be created and used before `open()`; their operations are held
/// until the connection is ready and then run in submission order.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Provider name, e.g. `"native"`.
    fn provider(&self) -> &str;

    /// Open the connection, releasing any operations queued so far.
    async fn open(&self) -> Result<()>;

    /// Close the connection and every queue created from it.
    async fn close(&self) -> Result<()>;

    /// Create a push (work producer) queue.
    async fn create_push_queue(&self, name: &str) -> Result<Box<dyn PushQueue>>;

    /// Create a pull (work consumer) queue. It starts pulling immediately.
    async fn create_pull_queue(&self, name: &str) -> Result<Box<dyn PullQueue>>;

    /// Create a publish queue on the exchange `name`.
    async fn create_publish_queue(&self, name: &str) -> Result<Box<dyn PublishQueue>>;

    /// Create a subscribe queue on the exchange `name`.
    async fn create_subscribe_queue(&self, name: &str) -> Result<Box<dyn SubscribeQueue>>;
}

/// Producer side of a work queue.
#[async_trait]
pub trait PushQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Queue a message for exactly one puller.
    async fn publish(&self, payload: Payload) -> Result<()>;

    /// Stop publishing; later calls to `publish` fail with `Closed`. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Consumer side of a work queue.
#[async_trait]
pub trait PullQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next message. `None` once the queue is closed and drained.
    async fn recv(&self) -> Option<Payload>;

    /// Stop pulling. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Producer side of a topic exchange.
#[async_trait]
pub trait PublishQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Publish to every subscriber whose pattern matches `topic`.
    ///
    /// `None` publishes on the empty topic.
    async fn publish(&self, payload: Payload, topic: Option<&str>) -> Result<()>;

    /// Stop publishing; later calls to `publish` fail with `Closed`. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Consumer side of a topic exchange.
#[async_trait]
pub trait SubscribeQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a pattern. `None` subscribes to everything.
    async fn subscribe(&self, pattern: Option<&str>) -> Result<SubscriptionId>;

    /// Remove a pattern. A second call for the same id is a no-op.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Wait for the next matching message.
    async fn recv(&self) -> Option<Delivery>;

    /// Drop every pattern of this queue. Idempotent.
    async fn close(&self) -> Result<()>;
}
