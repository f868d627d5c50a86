use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// The main service configuration (`zeppelin.json`): version information and
/// the list of pipelines to run.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_date: String,
    #[serde(default)]
    pipelines: Option<Vec<PipelineConfig>>,
    /// The first configuration format called the pipelines "sources".
    #[serde(default)]
    sources: Option<Vec<PipelineConfig>>,
    pub global_validation_rules: Option<Map<String, Value>>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        if config.pipelines().is_empty() {
            bail!("config file {} declares no pipelines", path.display());
        }

        Ok(config)
    }

    pub fn pipelines(&self) -> &[PipelineConfig] {
        self.pipelines
            .as_deref()
            .or(self.sources.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub class: String,
    pub source_broker: BrokerConfig,
    pub destination_broker: BrokerConfig,
    #[serde(default)]
    pub json_schema: Option<String>,
    /// Path of an extra, processor-owned configuration file (device tables
    /// for Zigbee, stores for the camera pipeline).
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub cloud_event: Map<String, Value>,
    #[serde(default)]
    pub validation_rules: Map<String, Value>,
    #[serde(default)]
    pub apply_global_validation_rules: bool,
    #[serde(default)]
    pub max_payload_size_bytes: u64,
    #[serde(default = "default_thread_interval")]
    pub thread_interval_sec: f64,
    #[serde(default)]
    pub data_types: Option<Vec<String>>,
    #[serde(default)]
    pub populate_ce_attributes: Option<Vec<String>>,
    #[serde(default)]
    pub device_id_attribute_name: Option<String>,
}

fn default_thread_interval() -> f64 {
    0.1
}

/// One side of a pipeline: which broker variant to bind and how.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub class: String,
    #[serde(default)]
    pub topic: Option<Topics>,
    #[serde(default = "default_true")]
    pub has_cloud_event: bool,
    #[serde(default = "default_throttle_max")]
    pub throttle_max_message_sec: u32,
    #[serde(default = "default_throttle_sleep")]
    pub throttle_sleep_sec: f64,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub iotedge: Option<EdgeConfig>,
    #[serde(default)]
    pub iothub: Option<HubConfig>,
}

fn default_true() -> bool {
    true
}

fn default_throttle_max() -> u32 {
    10
}

fn default_throttle_sleep() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Topics {
    One(String),
    Many(Vec<String>),
}

impl Topics {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Topics::One(topic) => vec![topic.clone()],
            Topics::Many(topics) => topics.clone(),
        }
    }

    /// The single destination topic, when one is configured.
    pub fn first(&self) -> Option<&str> {
        match self {
            Topics::One(topic) => Some(topic),
            Topics::Many(topics) => topics.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_certs: Option<String>,
    #[serde(default)]
    pub certfile: Option<String>,
    #[serde(default)]
    pub keyfile: Option<String>,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub enable_direct_method: bool,
    #[serde(default)]
    pub direct_method_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub direct_method_name: String,
    #[serde(default)]
    pub default_device_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_sec: f64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_sec: f64,
}

fn default_connection_timeout() -> f64 {
    15.0
}

fn default_response_timeout() -> f64 {
    30.0
}

/// Load a processor-owned configuration file (the pipeline's `config`
/// attribute), which must hold a JSON object.
pub fn load_json_object(path: &str) -> Result<Map<String, Value>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("unable to read config file {path}"))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("invalid config file {path}"))?;

    match value {
        Value::Object(map) => Ok(map),
        other => bail!("config file {path} is not an object: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "version": "2.4.0",
        "version_date": "2024-05-01",
        "global_validation_rules": {"units": ["kw"]},
        "pipelines": [{
            "name": "egauge",
            "class": "egauge",
            "source_broker": {"class": "MQTT", "topic": "egauge/in", "mqtt": {"host": "localhost"}},
            "destination_broker": {"class": "Void", "topic": "egauge/out"},
            "cloud_event": {"specversion": "1.0", "type": "t", "source": "s", "datacontenttype": "application/json"}
        }]
    }"#;

    #[test]
    fn loads_a_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().expect("Unable to create temp file");
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = ServiceConfig::load(file.path()).expect("Unable to load config");
        assert_eq!(config.version, "2.4.0");
        assert_eq!(config.pipelines().len(), 1);

        let pipeline = &config.pipelines()[0];
        assert_eq!(pipeline.class, "egauge");
        assert!((pipeline.thread_interval_sec - 0.1).abs() < f64::EPSILON);
        assert_eq!(pipeline.max_payload_size_bytes, 0);
        assert!(pipeline.source_broker.has_cloud_event);
        assert_eq!(pipeline.source_broker.throttle_max_message_sec, 10);
        assert_eq!(
            pipeline.source_broker.topic.as_ref().unwrap().to_vec(),
            vec!["egauge/in"]
        );
    }

    #[test]
    fn accepts_the_legacy_sources_key() {
        let text = MINIMAL.replace("\"pipelines\"", "\"sources\"");
        let mut file = tempfile::NamedTempFile::new().expect("Unable to create temp file");
        file.write_all(text.as_bytes()).unwrap();

        let config = ServiceConfig::load(file.path()).expect("Unable to load config");
        assert_eq!(config.pipelines().len(), 1);
    }

    #[test]
    fn rejects_an_empty_pipeline_list() {
        let mut file = tempfile::NamedTempFile::new().expect("Unable to create temp file");
        file.write_all(br#"{"pipelines": [], "global_validation_rules": {}}"#)
            .unwrap();
        assert!(ServiceConfig::load(file.path()).is_err());
    }

    #[test]
    fn topic_lists_deserialize() {
        let broker: BrokerConfig = serde_json::from_str(
            r#"{"class": "MQTT", "topic": ["a", "b"], "throttle_max_message_sec": 3}"#,
        )
        .expect("Unable to parse broker config");
        assert_eq!(broker.topic.unwrap().to_vec(), vec!["a", "b"]);
        assert_eq!(broker.throttle_max_message_sec, 3);
    }
}
