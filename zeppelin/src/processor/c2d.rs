use log::info;

use super::{Behavior, Flow, MessageState, ProcessorCore};

/// Cloud-to-device relay: the whole inbound payload is forwarded untouched.
/// The destination can be overridden per message, either by the transport's
/// custom properties or by a `dest_topic` attribute in the payload itself.
pub struct C2dBehavior;

impl Behavior for C2dBehavior {
    fn flow(&self) -> Flow {
        Flow::Passthrough
    }

    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_c2d_message_total.inc();

        if let Some(props) = &state.msg.props {
            info!("props({props:?})");
        }

        core.check_cloud_event(state.payload)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use crate::queue::InboundMessage;

    fn c2d_pipeline() -> serde_json::Value {
        json!({
            "name": "c2d",
            "class": "cloud2device",
            "cloud_event": {
                "specversion": "1.0",
                "type": "ca.qc.hydro.iot.c2d",
                "source": "",
                "datacontenttype": "application/json"
            }
        })
    }

    fn payload() -> serde_json::Value {
        json!({
            "specversion": "1.0",
            "source": "cloud-app",
            "datacontenttype": "application/json",
            "data": {"command": "reboot"}
        })
    }

    #[test]
    fn forwards_the_payload_unchanged_to_the_default_topic() {
        let (mut processor, metrics) = build_processor(c2d_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(&InboundMessage::from_value("in", payload()), &dst);

        assert_eq!(metrics.rx_message_valid.get(), 1);
        assert_eq!(metrics.tx_message_total.get(), 1);

        let published = dst.published();
        let (topic, outbound, _) = &published[0];
        assert_eq!(topic, "out");
        assert_eq!(outbound, &payload());
    }

    #[test]
    fn payload_dest_topic_wins_over_props_and_default() {
        let (mut processor, _metrics) = build_processor(c2d_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        let mut inbound = payload();
        inbound["dest_topic"] = json!("from-payload");
        let msg = InboundMessage::from_value("in", inbound).with_props(HashMap::from([(
            "dest_topic".to_owned(),
            "from-props".to_owned(),
        )]));
        processor.handle(&msg, &dst);

        let (topic, _, _) = &dst.published()[0];
        assert_eq!(topic, "from-payload");
    }

    #[test]
    fn props_dest_topic_wins_over_default() {
        let (mut processor, _metrics) = build_processor(c2d_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        let msg = InboundMessage::from_value("in", payload()).with_props(HashMap::from([(
            "dest_topic".to_owned(),
            "from-props".to_owned(),
        )]));
        processor.handle(&msg, &dst);

        let (topic, _, _) = &dst.published()[0];
        assert_eq!(topic, "from-props");
    }
}
