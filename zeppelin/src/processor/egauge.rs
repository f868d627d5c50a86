use log::{error, info};
use serde_json::Value;

use super::{Behavior, MessageState, ProcessorCore};

/// Power meter events: the inner data must name a device and carry a
/// `values` list that satisfies the pipeline's validation rules.
pub struct EgaugeBehavior;

impl Behavior for EgaugeBehavior {
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_egauge_message_total.inc();

        if !core.check_cloud_event(state.payload) {
            return false;
        }

        state.device_model = "egauge".to_owned();
        info!("device_model({})", state.device_model);

        true
    }

    fn validate(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        if !core.validate_payload(state) {
            return false;
        }

        let Some(data) = &state.data else {
            return false;
        };

        if data.get("device").map(Value::is_null).unwrap_or(true) {
            error!("invalid device in data({data})");
            return false;
        }

        let Some(values) = data.get("values").and_then(Value::as_array) else {
            error!("invalid values in data({data})");
            return false;
        };

        core.rules.check_values(values)
    }
}
