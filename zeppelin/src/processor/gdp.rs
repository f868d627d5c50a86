use super::{Behavior, Flow, MessageState, ProcessorCore};

/// Grid data point relays: the inbound `data` is republished bare (no new
/// envelope) and retained, so late subscribers immediately see the latest
/// value.
pub struct GdpBehavior;

impl Behavior for GdpBehavior {
    fn flow(&self) -> Flow {
        Flow::RawData
    }

    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_gdp_message_total.inc();
        core.check_cloud_event(state.payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use crate::queue::InboundMessage;

    fn gdp_pipeline() -> serde_json::Value {
        json!({
            "name": "gdp",
            "class": "gdp",
            "cloud_event": {
                "specversion": "1.0",
                "type": "ca.qc.hydro.iot.gdp",
                "source": "",
                "datacontenttype": "application/json"
            }
        })
    }

    #[test]
    fn republishes_the_bare_data_with_retain() {
        let (mut processor, metrics) = build_processor(gdp_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        let data = json!({"price": 0.073, "window": "2024-01-01T13:00"});
        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "source": "gdp-manager",
                    "datacontenttype": "application/json",
                    "data": data
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 1);
        assert_eq!(metrics.tx_message_total.get(), 1);

        let published = dst.published();
        assert_eq!(published.len(), 1);
        let (topic, outbound, opts) = &published[0];
        assert_eq!(topic, "out");
        // no envelope: the payload is exactly the inbound data field
        assert_eq!(outbound, &data);
        assert_eq!(opts.retain, Some(true));
    }

    #[test]
    fn null_data_never_reaches_the_broker() {
        let (mut processor, metrics) = build_processor(gdp_pipeline(), json!({}));
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "source": "gdp-manager",
                    "datacontenttype": "application/json",
                    "data": {"x": 1}
                }),
            ),
            &dst,
        );
        assert_eq!(metrics.rx_message_valid.get(), 1);

        // a payload whose data is null never reaches the broker
        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "source": "gdp-manager",
                    "datacontenttype": "application/json",
                    "data": null
                }),
            ),
            &dst,
        );
        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert_eq!(dst.published().len(), 1);
    }
}
