use anyhow::{bail, Result};
use log::{debug, error};
use serde_json::{Map, Value};

use crate::config::PipelineConfig;

use super::{Behavior, MessageState, ProcessorCore};

const VALID_DATA_TYPES: [&str; 1] = ["ca.qc.hydro.iot.rci.command"];

/// Command forwarding in both directions. In the cloud the destination topic
/// is read from an envelope attribute (the target device id, configured with
/// `device_id_attribute_name`) and handed to the hub-service transport; on
/// the edge the pipeline's default destination applies.
pub struct RciCommandBehavior {
    device_id_attribute_name: Option<String>,
    data_types: Vec<String>,
}

impl RciCommandBehavior {
    pub fn new(pipeline: &PipelineConfig) -> Result<Self> {
        let data_types = match &pipeline.data_types {
            None => VALID_DATA_TYPES.map(str::to_owned).to_vec(),
            Some(data_types) => {
                if data_types.iter().any(String::is_empty) {
                    bail!("invalid data_types({data_types:?})");
                }
                data_types.clone()
            }
        };

        debug!(
            "command forwarding with device_id_attribute_name({:?}) data_types({data_types:?})",
            pipeline.device_id_attribute_name
        );

        Ok(RciCommandBehavior {
            device_id_attribute_name: pipeline.device_id_attribute_name.clone(),
            data_types,
        })
    }
}

impl Behavior for RciCommandBehavior {
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        if self.device_id_attribute_name.is_some() {
            core.metrics.tx_cmd_message_total.inc();
        } else {
            core.metrics.rx_cmd_message_total.inc();
        }

        if !core.check_cloud_event(state.payload) {
            return false;
        }

        let data_type = state.payload.get("type").and_then(Value::as_str);
        if !data_type.is_some_and(|t| self.data_types.iter().any(|accepted| accepted == t)) {
            error!("invalid data type({data_type:?})");
            return false;
        }

        state.device_model = String::new();

        if let Some(attribute) = &self.device_id_attribute_name {
            let device_id = state
                .payload
                .get(attribute)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty());

            let Some(device_id) = device_id else {
                error!("invalid device_id in attribute({attribute})");
                return false;
            };
            state.dest_topic = Some(device_id.to_owned());
        }

        true
    }

    fn finalize_envelope(
        &self,
        _core: &ProcessorCore,
        state: &MessageState,
        envelope: &mut Map<String, Value>,
    ) {
        if let Some(data_type) = state.payload.get("type") {
            envelope.insert("type".to_owned(), data_type.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use crate::queue::InboundMessage;

    fn command_pipeline(with_attribute: bool) -> serde_json::Value {
        let mut pipeline = json!({
            "name": "rci-command",
            "class": "rci_command",
            "cloud_event": {
                "specversion": "1.0",
                "type": "ca.qc.hydro.iot.rci.command",
                "source": "",
                "datacontenttype": "application/json"
            }
        });
        if with_attribute {
            pipeline["device_id_attribute_name"] = json!("device_id");
        }
        pipeline
    }

    fn command() -> serde_json::Value {
        json!({
            "specversion": "1.0",
            "type": "ca.qc.hydro.iot.rci.command",
            "source": "scheduler",
            "device_id": "edge-42",
            "datacontenttype": "application/json",
            "data": {"setpoint": 19.5}
        })
    }

    #[test]
    fn cloud_fan_out_routes_to_the_device_id() {
        let (mut processor, metrics) = build_processor(command_pipeline(true), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(&InboundMessage::from_value("in", command()), &dst);

        assert_eq!(metrics.tx_cmd_message_total.get(), 1);
        assert_eq!(metrics.rx_cmd_message_total.get(), 0);
        assert_eq!(metrics.tx_message_total.get(), 1);

        let published = dst.published();
        let (topic, outbound, _) = &published[0];
        assert_eq!(topic, "edge-42");
        assert_eq!(outbound["type"], "ca.qc.hydro.iot.rci.command");
        assert_eq!(outbound["data"], json!({"setpoint": 19.5}));
    }

    #[test]
    fn edge_side_uses_the_default_topic() {
        let (mut processor, metrics) = build_processor(command_pipeline(false), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(&InboundMessage::from_value("in", command()), &dst);

        assert_eq!(metrics.rx_cmd_message_total.get(), 1);
        let (topic, _, _) = &dst.published()[0];
        assert_eq!(topic, "out");
    }

    #[test]
    fn missing_routing_attribute_is_invalid() {
        let (mut processor, metrics) = build_processor(command_pipeline(true), json!({}));
        let dst = CaptureTransport::new();

        let mut inbound = command();
        inbound.as_object_mut().unwrap().remove("device_id");
        processor.handle(&InboundMessage::from_value("in", inbound), &dst);

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert!(dst.published().is_empty());
    }

    #[test]
    fn wrong_type_is_invalid() {
        let (mut processor, metrics) = build_processor(command_pipeline(false), json!({}));
        let dst = CaptureTransport::new();

        let mut inbound = command();
        inbound["type"] = json!("ca.qc.hydro.iot.other");
        processor.handle(&InboundMessage::from_value("in", inbound), &dst);

        assert_eq!(metrics.rx_message_invalid.get(), 1);
    }
}
