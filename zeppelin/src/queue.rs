use std::collections::HashMap;
use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Inbound payloads are JSON nearly everywhere, but some sources (camera
/// block streams, opaque relays) hand us bytes that don't decode. Those are
/// queued raw and it is up to the processor to either consume them or drop
/// the message as invalid.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    Raw(Vec<u8>),
}

impl Payload {
    pub fn from_bytes(bytes: &[u8]) -> Payload {
        match serde_json::from_slice(bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(bytes.to_vec()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }
}

/// One message as queued between a transport's receive path and a pipeline
/// worker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub size: usize,
    pub received_at: DateTime<Utc>,
    pub props: Option<HashMap<String, String>>,
}

impl InboundMessage {
    pub fn from_bytes(topic: &str, bytes: &[u8]) -> Self {
        InboundMessage {
            topic: topic.to_owned(),
            payload: Payload::from_bytes(bytes),
            size: bytes.len(),
            received_at: Utc::now(),
            props: None,
        }
    }

    pub fn from_value(topic: &str, value: Value) -> Self {
        let size = value.to_string().len();
        InboundMessage {
            topic: topic.to_owned(),
            payload: Payload::Json(value),
            size,
            received_at: Utc::now(),
            props: None,
        }
    }

    pub fn with_props(mut self, props: HashMap<String, String>) -> Self {
        self.props = Some(props);
        self
    }
}

pub type QueueSender = mpsc::Sender<InboundMessage>;
pub type QueueReceiver = mpsc::Receiver<InboundMessage>;

/// The pipeline-owned FIFO queue. Unbounded: backpressure is the throttle's
/// job, not the channel's.
pub fn queue() -> (QueueSender, QueueReceiver) {
    mpsc::channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payloads_decode() {
        let msg = InboundMessage::from_bytes("t", br#"{"a":1}"#);
        assert_eq!(msg.size, 7);
        assert_eq!(msg.payload.as_json().unwrap()["a"], 1);
    }

    #[test]
    fn undecodable_payloads_stay_raw() {
        let msg = InboundMessage::from_bytes("t", &[0xff, 0x00, b'{']);
        assert!(msg.payload.as_json().is_none());
        assert!(matches!(&msg.payload, Payload::Raw(bytes) if bytes.len() == 3));
    }
}
