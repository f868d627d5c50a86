use anyhow::{bail, Result};
use log::{error, warn};
use serde_json::{Map, Value};

use crate::config::PipelineConfig;

use super::{Behavior, MessageState, ProcessorCore};

/// Handles any CloudEvent-shaped source. The pipeline may narrow the accepted
/// `type` values with `data_types` and copy extra envelope attributes from
/// the inbound event with `populate_ce_attributes`.
pub struct GenericBehavior {
    data_types: Option<Vec<String>>,
    populate_ce_attributes: Option<Vec<String>>,
}

impl GenericBehavior {
    pub fn new(pipeline: &PipelineConfig) -> Result<Self> {
        if let Some(data_types) = &pipeline.data_types {
            if data_types.iter().any(String::is_empty) {
                bail!("invalid data_types({data_types:?})");
            }
        }

        Ok(GenericBehavior {
            data_types: pipeline.data_types.clone(),
            populate_ce_attributes: pipeline.populate_ce_attributes.clone(),
        })
    }
}

impl Behavior for GenericBehavior {
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_generic_message_total.inc();

        if !core.check_cloud_event(state.payload) {
            return false;
        }

        if let Some(data_types) = &self.data_types {
            let data_type = state.payload.get("type").and_then(Value::as_str);
            if !data_type.is_some_and(|t| data_types.iter().any(|accepted| accepted == t)) {
                error!("invalid data type({data_type:?})");
                return false;
            }
        }

        true
    }

    fn finalize_envelope(
        &self,
        _core: &ProcessorCore,
        state: &MessageState,
        envelope: &mut Map<String, Value>,
    ) {
        let Some(attributes) = &self.populate_ce_attributes else {
            return;
        };

        for attr in attributes {
            match state.payload.get(attr) {
                Some(value) => {
                    envelope.insert(attr.clone(), value.clone());
                }
                None => warn!("attribute({attr}) not found in payload, skipping population"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use crate::queue::InboundMessage;

    #[test]
    fn identity_law_modulo_id_and_time() {
        let (mut processor, metrics) = build_processor(
            json!({
                "name": "generic",
                "class": "generic",
                "destination_broker": {"class": "Void", "topic": "out"},
                "cloud_event": {
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.generic",
                    "source": "",
                    "datacontenttype": "application/json"
                },
                "populate_ce_attributes": ["subject"]
            }),
            json!({}),
        );
        let dst = CaptureTransport::new();

        let inbound = json!({
            "specversion": "1.0",
            "id": "11111111-1111-4111-8111-111111111111",
            "time": "2024-01-01T00:00:00+00:00",
            "type": "ca.qc.hydro.iot.generic",
            "source": "dev-1",
            "subject": "building-7",
            "datacontenttype": "application/json",
            "data": {"a": 1, "b": [1, 2, 3]}
        });
        processor.handle(&InboundMessage::from_value("in", inbound.clone()), &dst);

        assert_eq!(metrics.rx_message_valid.get(), 1);
        assert_eq!(metrics.tx_message_total.get(), 1);

        let published = dst.published();
        assert_eq!(published.len(), 1);
        let (topic, outbound, _) = &published[0];
        assert_eq!(topic, "out");

        assert_eq!(outbound["specversion"], inbound["specversion"]);
        assert_eq!(outbound["type"], inbound["type"]);
        assert_eq!(outbound["source"], inbound["source"]);
        assert_eq!(outbound["datacontenttype"], inbound["datacontenttype"]);
        assert_eq!(outbound["data"], inbound["data"]);
        assert_eq!(outbound["subject"], inbound["subject"]);
        // fresh envelope identity
        assert_ne!(outbound["id"], inbound["id"]);
        assert_ne!(outbound["time"], inbound["time"]);
    }

    #[test]
    fn type_allow_list_rejects_unknown_events() {
        let (mut processor, metrics) = build_processor(
            json!({
                "name": "generic",
                "class": "generic",
                "cloud_event": {
                    "specversion": "1.0",
                    "type": "t",
                    "source": "",
                    "datacontenttype": "application/json"
                },
                "data_types": ["ca.qc.hydro.iot.known"]
            }),
            json!({}),
        );
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.unknown",
                    "datacontenttype": "application/json",
                    "data": {}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert!(dst.published().is_empty());

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.known",
                    "datacontenttype": "application/json",
                    "data": {}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 1);
        assert_eq!(dst.published().len(), 1);
    }

    #[test]
    fn empty_data_type_entries_fail_construction() {
        let pipeline: crate::config::PipelineConfig = serde_json::from_value(json!({
            "name": "generic",
            "class": "generic",
            "source_broker": {"class": "Void"},
            "destination_broker": {"class": "Void"},
            "data_types": ["ok", ""]
        }))
        .unwrap();

        assert!(super::GenericBehavior::new(&pipeline).is_err());
    }
}
