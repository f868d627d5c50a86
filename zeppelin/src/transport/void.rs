use std::sync::Arc;

use serde_json::Value;

use crate::metrics::Metrics;
use crate::queue::QueueSender;
use crate::throttle::Throttle;

use super::{PublishOptions, Transport};

/// Accepts everything and delivers nothing. Used for draining pipelines and
/// in tests.
pub struct VoidTransport {
    throttle: Throttle,
}

impl VoidTransport {
    pub fn new() -> Self {
        VoidTransport {
            throttle: Throttle::new(10, 1.0),
        }
    }
}

impl Default for VoidTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for VoidTransport {
    fn publish_opts(&self, _topic: &str, _payload: &Value, _opts: PublishOptions) -> bool {
        true
    }

    fn start_listening(&self, _topics: &[String], _queue: QueueSender) -> bool {
        true
    }

    fn disconnect(&self) {}

    fn set_metrics(&self, _metrics: Arc<Metrics>) {}

    fn set_max_msg_sec(&self, max_msg_sec: u32) {
        self.throttle.set_max_msg_sec(max_msg_sec);
    }

    fn set_sleep_sec(&self, sleep_sec: f64) {
        self.throttle.set_sleep_sec(sleep_sec);
    }
}
