use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use super::{Behavior, MessageState, ProcessorCore};

/// Zigbee sensors report flat readings; the processor projects them into the
/// normalized `{device, values: [...]}` record using the per-model field
/// table from the pipeline's config file.
pub struct ZigbeeBehavior {
    device_config: Vec<Value>,
    data_fields: Vec<String>,
}

impl ZigbeeBehavior {
    pub fn new() -> Self {
        ZigbeeBehavior {
            device_config: Vec::new(),
            data_fields: Vec::new(),
        }
    }
}

impl Behavior for ZigbeeBehavior {
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.metrics.rx_zigbee_message_total.inc();
        core.check_cloud_event(state.payload)
    }

    fn validate(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        if !core.validate_payload(state) {
            return false;
        }

        let data = state.data.as_ref().expect("validate_payload sets data");

        // the device model comes from the event subject, with the data's own
        // device record as a fallback
        let mut subject = state
            .payload
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if subject.is_empty() {
            subject = data
                .get("device")
                .and_then(|device| device.get("model"))
                .and_then(Value::as_str)
                .unwrap_or_default();
        }

        if subject.is_empty() {
            error!("invalid subject. Subject must contain device model.");
            return false;
        }

        state.device_model = subject.to_uppercase();
        info!("device_model({})", state.device_model);

        let Some(devices) = core.config.get("devices") else {
            error!("devices not defined in config");
            return false;
        };

        let Some(device_config) = devices.get(&state.device_model).and_then(Value::as_array)
        else {
            error!("unknown device model({})", state.device_model);
            return false;
        };
        self.device_config = device_config.clone();
        debug!("device_config({device_config:?})");

        let Some(data_fields) = core.config.get("data_fields").and_then(Value::as_array) else {
            error!("data_fields not defined in config");
            return false;
        };
        self.data_fields = data_fields
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();

        true
    }

    fn normalize(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        let Some(data) = state.data.take() else {
            return false;
        };

        let mut normalized = Map::new();
        normalized.insert(
            "device".to_owned(),
            data.get("device").cloned().unwrap_or(Value::Null),
        );

        let mut values = Vec::new();
        for item in &self.device_config {
            let Some(field) = item.get("field").and_then(Value::as_str) else {
                error!("device config entry({item}) has no field");
                return false;
            };

            let Some(reading) = data.get(field) else {
                let mandatory = item.get("mandatory").and_then(Value::as_bool).unwrap_or(true);
                if mandatory {
                    error!(
                        "field({field}) not defined in data for device_model({})",
                        state.device_model
                    );
                    return false;
                }
                warn!(
                    "field({field}) not defined in data for device_model({})",
                    state.device_model
                );
                continue;
            };

            let mut value = Map::new();
            value.insert("value".to_owned(), reading.clone());
            for data_field in &self.data_fields {
                value.insert(
                    data_field.clone(),
                    item.get(data_field).cloned().unwrap_or(Value::Null),
                );
            }
            values.push(Value::Object(value));
        }

        let passes = core.rules.check_values(&values);
        normalized.insert("values".to_owned(), Value::Array(values));
        state.data = Some(Value::Object(normalized));

        passes
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use crate::queue::InboundMessage;

    fn device_table() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("Unable to create temp file");
        file.write_all(
            json!({
                "devices": {
                    "XYZ": [
                        {"field": "t", "unit": "C", "value_type": "float", "mandatory": true},
                        {"field": "h", "unit": "%", "value_type": "float", "mandatory": false}
                    ]
                },
                "data_fields": ["unit", "value_type"]
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        file
    }

    fn zigbee_pipeline(config_path: &str) -> serde_json::Value {
        json!({
            "name": "zigbee",
            "class": "zigbee",
            "config": config_path,
            "cloud_event": {
                "specversion": "1.0",
                "type": "ca.qc.hydro.iot.zigbee",
                "source": "",
                "datacontenttype": "application/json"
            }
        })
    }

    #[test]
    fn projects_fields_into_normalized_values() {
        let table = device_table();
        let (mut processor, metrics) = build_processor(
            zigbee_pipeline(table.path().to_str().unwrap()),
            json!({"units": ["c", "%"]}),
        );
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "subject": "xyz",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"device": {"model": "xyz"}, "t": 21.5}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 1);
        let published = dst.published();
        assert_eq!(published.len(), 1);
        let (_, outbound, _) = &published[0];

        assert_eq!(
            outbound["data"],
            json!({
                "device": {"model": "xyz"},
                "values": [{"value": 21.5, "unit": "C", "value_type": "float"}]
            })
        );
        assert_eq!(outbound["device_model"], "XYZ");
    }

    #[test]
    fn model_falls_back_to_the_device_record() {
        let table = device_table();
        let (mut processor, metrics) = build_processor(
            zigbee_pipeline(table.path().to_str().unwrap()),
            json!({"units": ["c", "%"]}),
        );
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"device": {"model": "xyz"}, "t": 19.0, "h": 40.0}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 1);
        let (_, outbound, _) = &dst.published()[0];
        let values = outbound["data"]["values"].as_array().unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn missing_mandatory_field_is_invalid() {
        let table = device_table();
        let (mut processor, metrics) = build_processor(
            zigbee_pipeline(table.path().to_str().unwrap()),
            json!({"units": ["c", "%"]}),
        );
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "subject": "xyz",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"device": {"model": "xyz"}, "h": 40.0}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert!(dst.published().is_empty());
    }

    #[test]
    fn unknown_model_is_invalid() {
        let table = device_table();
        let (mut processor, metrics) = build_processor(
            zigbee_pipeline(table.path().to_str().unwrap()),
            json!({"units": ["c"]}),
        );
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_value(
                "in",
                json!({
                    "specversion": "1.0",
                    "subject": "nope",
                    "source": "dev-1",
                    "datacontenttype": "application/json",
                    "data": {"t": 1.0}
                }),
            ),
            &dst,
        );

        assert_eq!(metrics.rx_message_invalid.get(), 1);
    }
}
