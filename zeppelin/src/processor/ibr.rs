use log::error;
use serde_json::{Map, Value};

use super::{Behavior, MessageState, ProcessorCore};

const VALID_DATA_TYPES: [&str; 6] = [
    "ca.qc.hydro.iot.ibr.egauge",
    "ca.qc.hydro.iot.ibr.insighthome",
    "ca.qc.hydro.iot.ibr.predictivecontrol",
    "ca.qc.hydro.iot.ibr.outage",
    "ca.qc.hydro.iot.ibr.drift",
    "ca.qc.hydro.iot.ibr.optimize",
];

/// Residential battery events arrive under one of the fixed `type`s; the
/// type token decides the device model and the inbound type survives into the
/// outbound envelope.
pub struct IbrBehavior;

impl Behavior for IbrBehavior {
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_ibr_message_total.inc();

        if !core.check_cloud_event(state.payload) {
            return false;
        }

        let data_type = state.payload.get("type").and_then(Value::as_str);
        let Some(data_type) = data_type.filter(|t| VALID_DATA_TYPES.contains(t)) else {
            error!("invalid data type({data_type:?})");
            return false;
        };

        state.device_model = if data_type.contains("egauge") {
            "eGauge".to_owned()
        } else if data_type.contains("insighthome") {
            "InsightHome".to_owned()
        } else {
            String::new()
        };

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

    fn ibr_pipeline() -> serde_json::Value {
        json!({
            "name": "ibr",
            "class": "ibr",
            "cloud_event": {
                "specversion": "1.0",
                "type": "ca.qc.hydro.iot.ibr",
                "source": "",
                "datacontenttype": "application/json"
            }
        })
    }

    #[test]
    fn inbound_type_survives_into_the_envelope() {
        let (mut processor, metrics) = build_processor(ibr_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.ibr.insighthome",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"soc": 88}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 1);
        let (_, outbound, _) = &dst.published()[0];
        assert_eq!(outbound["type"], "ca.qc.hydro.iot.ibr.insighthome");
        assert_eq!(outbound["device_model"], "InsightHome");
    }

    #[test]
    fn unknown_type_is_invalid() {
        let (mut processor, metrics) = build_processor(ibr_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.ibr.unheard_of",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert!(dst.published().is_empty());
    }

    #[test]
    fn outage_events_have_no_device_model() {
        let (mut processor, _metrics) = build_processor(ibr_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "type": "ca.qc.hydro.iot.ibr.outage",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"down": true}
                }),
            ),
            &dst,
        );

        let (_, outbound, _) = &dst.published()[0];
        assert_eq!(outbound["device_model"], "");
    }
}
