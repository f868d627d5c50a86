use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use serde_json::Value;

use crate::config::BrokerConfig;
use crate::metrics::Metrics;
use crate::queue::QueueSender;

mod device;
mod edge;
mod hub;
mod mqtt;
pub(crate) mod property_bag;
pub(crate) mod sas;
mod void;

pub use device::CloudDeviceTransport;
pub use edge::EdgeHubTransport;
pub use hub::CloudHubTransport;
pub use mqtt::MqttTransport;
pub use void::VoidTransport;

/// Per-call overrides for the destination broker's defaults. Only MQTT has a
/// use for them; the other variants ignore the options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub retain: Option<bool>,
    pub qos: Option<u8>,
}

/// What every broker binding offers to a pipeline. Errors never escape as
/// panics or results; a failed publish is `false` and the pipeline does not
/// retry at this layer.
pub trait Transport: Send {
    fn publish(&self, topic: &str, payload: &Value) -> bool {
        self.publish_opts(topic, payload, PublishOptions::default())
    }

    fn publish_opts(&self, topic: &str, payload: &Value, opts: PublishOptions) -> bool;

    /// Route messages arriving on `topics` into `queue`. Transports that
    /// cannot receive return `false`.
    fn start_listening(&self, topics: &[String], queue: QueueSender) -> bool;

    fn disconnect(&self);

    fn get_device_id(&self) -> String {
        edge_device_id()
    }

    fn set_metrics(&self, metrics: Arc<Metrics>);

    fn set_max_msg_sec(&self, max_msg_sec: u32);

    fn set_sleep_sec(&self, sleep_sec: f64);
}

pub(crate) fn edge_device_id() -> String {
    env::var("IOTEDGE_DEVICEID").unwrap_or_default()
}

/// JSON values publish as serialized JSON; strings go out as-is.
pub(crate) fn payload_bytes(payload: &Value) -> Vec<u8> {
    match payload {
        Value::String(text) => text.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// Build the transport a broker config asks for. The class tag tolerates
/// spacing and separator noise (`IoT-Edge`, `iot_edge`, ...).
pub fn create(config: &BrokerConfig) -> Result<Box<dyn Transport>> {
    let class: String = config
        .class
        .trim()
        .to_uppercase()
        .replace([' ', '-', '_'], "");
    info!("class({class})");

    let transport: Box<dyn Transport> = match class.as_str() {
        "IOTEDGE" => {
            let edge_config = config.iotedge.clone().unwrap_or_default();
            Box::new(EdgeHubTransport::new(&edge_config)?)
        }
        "IOTDEVICE" => Box::new(CloudDeviceTransport::new()?),
        "IOTHUB" => {
            let hub_config = config
                .iothub
                .as_ref()
                .context("iothub configuration not defined")?;
            Box::new(CloudHubTransport::new(hub_config)?)
        }
        "MQTT" => {
            let mqtt_config = config.mqtt.as_ref().context("mqtt configuration not defined")?;
            Box::new(MqttTransport::new(mqtt_config)?)
        }
        "VOID" => Box::new(VoidTransport::new()),
        other => bail!("unsupported broker class({other})"),
    };

    transport.set_max_msg_sec(config.throttle_max_message_sec);
    transport.set_sleep_sec(config.throttle_sleep_sec);

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_payloads_publish_verbatim() {
        assert_eq!(payload_bytes(&json!("plain text")), b"plain text".to_vec());
        assert_eq!(payload_bytes(&json!({"a": 1})), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn factory_normalizes_the_class_tag() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"class": " v-o_id "}"#).expect("Unable to parse config");
        assert!(create(&config).is_ok());

        let config: BrokerConfig =
            serde_json::from_str(r#"{"class": "warehouse"}"#).expect("Unable to parse config");
        assert!(create(&config).is_err());
    }

    #[test]
    fn factory_requires_the_inner_config() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"class": "MQTT"}"#).expect("Unable to parse config");
        assert!(create(&config).is_err());
    }
}
