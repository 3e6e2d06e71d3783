//! Messages exchanged between the coordinator and its workers.

use serde::{Deserialize, Serialize};

use crate::bus::Payload;

/// One control or delivery message on a worker link.
///
/// Serialized as JSON tagged by `kind`, e.g.
/// `{"kind":"push-request","queueName":"jobs","payload":1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Worker → coordinator: register the sender on a work queue.
    #[serde(rename_all = "camelCase")]
    StartPull { queue_name: String },

    /// Worker → coordinator: unregister the sender from a work queue.
    #[serde(rename_all = "camelCase")]
    StopPull { queue_name: String },

    /// Worker → coordinator: push onto a work queue.
    #[serde(rename_all = "camelCase")]
    PushRequest { queue_name: String, payload: Payload },

    /// Worker → coordinator: publish on a topic queue.
    #[serde(rename_all = "camelCase")]
    PublishRequest {
        queue_name: String,
        topic: String,
        payload: Payload,
    },

    /// Coordinator → worker: a work item for one of its pull facades.
    #[serde(rename_all = "camelCase")]
    PushDelivery { queue_name: String, payload: Payload },

    /// Coordinator → worker: a published message to match locally.
    #[serde(rename_all = "camelCase")]
    PublishDelivery {
        queue_name: String,
        topic: String,
        payload: Payload,
    },

    /// Any kind this build does not understand.
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// The `kind` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartPull { .. } => "start-pull",
            Self::StopPull { .. } => "stop-pull",
            Self::PushRequest { .. } => "push-request",
            Self::PublishRequest { .. } => "publish-request",
            Self::PushDelivery { .. } => "push-delivery",
            Self::PublishDelivery { .. } => "publish-delivery",
            Self::Unknown => "unknown",
        }
    }

    pub fn queue_name(&self) -> Option<&str> {
        match self {
            Self::StartPull { queue_name }
            | Self::StopPull { queue_name }
            | Self::PushRequest { queue_name, .. }
            | Self::PublishRequest { queue_name, .. }
            | Self::PushDelivery { queue_name, .. }
            | Self::PublishDelivery { queue_name, .. } => Some(queue_name.as_str()),
            Self::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let message = WireMessage::PublishRequest {
            queue_name: "orders".to_string(),
            topic: "orders.urgent".to_string(),
            payload: json!({"id": 1}),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "kind": "publish-request",
                "queueName": "orders",
                "topic": "orders.urgent",
                "payload": {"id": 1}
            })
        );
    }

    #[test]
    fn test_decode_start_pull() {
        let message: WireMessage =
            serde_json::from_value(json!({"kind": "start-pull", "queueName": "jobs"})).unwrap();
        assert_eq!(
            message,
            WireMessage::StartPull {
                queue_name: "jobs".to_string()
            }
        );
        assert_eq!(message.kind(), "start-pull");
        assert_eq!(message.queue_name(), Some("jobs"));
    }

    #[test]
    fn test_payload_shapes_survive() {
        for payload in [
            json!("text"),
            json!(3.5),
            json!([1, 2, 3]),
            json!({"nested": {"bytes": [0, 255]}}),
            json!(null),
        ] {
            let message = WireMessage::PushDelivery {
                queue_name: "jobs".to_string(),
                payload: payload.clone(),
            };
            let text = serde_json::to_string(&message).unwrap();
            let back: WireMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let message: WireMessage =
            serde_json::from_value(json!({"kind": "barrier", "queueName": "jobs"})).unwrap();
        assert_eq!(message, WireMessage::Unknown);
        assert_eq!(message.queue_name(), None);
    }
}
