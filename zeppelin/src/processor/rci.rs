use log::error;
use serde_json::Value;

use super::{Behavior, MessageState, ProcessorCore};

/// Building controller readings: a flat object of numeric samples with no
/// CloudEvent envelope on the way in. A non-numeric sample is counted
/// invalid but does not sink the rest of the record.
pub struct RciBehavior;

impl Behavior for RciBehavior {
    fn assess(&mut self, core: &ProcessorCore, _state: &mut MessageState) -> bool {
        core.metrics.rx_rci_message_total.inc();
        // these sources don't wrap their readings in a CloudEvent
        true
    }

    fn validate(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        if !core.validate_payload(state) {
            return false;
        }

        let Some(data) = state.data.as_ref().and_then(Value::as_object) else {
            error!("data is not an object");
            return false;
        };

        for (key, value) in data {
            if !value.is_number() {
                error!("data({key}) is not a number: value({value})");
                core.metrics.rx_message_invalid.inc();
            }
        }

        true
    }
}
