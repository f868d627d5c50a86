use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::cloudevent;
use crate::config::{load_json_object, PipelineConfig, ServiceConfig};
use crate::metrics::Metrics;
use crate::queue::{InboundMessage, Payload};
use crate::rules::{merge_rules, RulesEngine};
use crate::transport::{PublishOptions, Transport};

mod c2d;
mod camera;
mod egauge;
mod gdp;
mod generic;
mod ibr;
mod rci;
mod rci_command;
mod zigbee;

pub use camera::CameraBehavior;

/// How a variant's result leaves the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Wrap the produced data in a fresh CloudEvent envelope (the default).
    Envelope,
    /// Publish the inbound `data` field as-is, retained (GDP).
    RawData,
    /// Publish the whole inbound payload as-is (cloud-to-device relay).
    Passthrough,
    /// Feed the raw message into the block reassembly engine (camera).
    Assemble,
}

/// Everything a processor keeps across messages: limits, templates, compiled
/// schema, merged rules and the metrics handles.
pub struct ProcessorCore {
    pub name: String,
    pub device_id: String,
    pub cloud_event: Map<String, Value>,
    pub schema: Option<jsonschema::Validator>,
    pub rules: RulesEngine,
    pub max_payload_size_bytes: u64,
    pub dest_topic: Option<String>,
    pub src_has_cloud_event: bool,
    /// Contents of the pipeline's own config file, when one is declared.
    pub config: Map<String, Value>,
    pub metrics: Arc<Metrics>,
}

impl ProcessorCore {
    pub fn check_cloud_event(&self, payload: &Value) -> bool {
        if !self.src_has_cloud_event {
            return true;
        }
        if !cloudevent::check_spec_version(payload) {
            error!("invalid payload. specversion is not defined or unsupported");
            return false;
        }
        true
    }

    fn check_schema(&self, payload: &Value) -> bool {
        match &self.schema {
            None => {
                info!("no schema");
                true
            }
            Some(validator) => {
                if validator.is_valid(payload) {
                    true
                } else {
                    error!("payload failed schema validation");
                    false
                }
            }
        }
    }

    /// The shared validation every variant builds on: schema check, data
    /// extraction, and the content-type coherence rules.
    pub fn validate_payload(&self, state: &mut MessageState) -> bool {
        let payload = state.payload;

        if !self.check_schema(payload) {
            return false;
        }

        let data = if self.src_has_cloud_event {
            let label = if state.is_base64 { "data_base64" } else { "data" };
            payload.get(label).cloned()
        } else {
            Some(payload.clone())
        };

        let Some(data) = data.filter(|data| !data.is_null()) else {
            error!("no data");
            return false;
        };

        if self.src_has_cloud_event {
            let Some(datacontenttype) = payload.get("datacontenttype").and_then(Value::as_str)
            else {
                error!("invalid datacontenttype");
                return false;
            };

            if (state.compressed || state.is_base64) && !data.is_string() {
                error!("compressed/base64 data but data field is not a string");
                return false;
            }

            if datacontenttype.contains("application/json")
                && !state.compressed
                && !state.is_base64
                && !data.is_object()
            {
                error!("invalid data({data})");
                return false;
            }
        }

        state.data = Some(data);
        true
    }
}

/// Working state for one message as it moves through the stages.
pub struct MessageState<'m> {
    pub msg: &'m InboundMessage,
    pub payload: &'m Value,
    pub data: Option<Value>,
    pub compressed: bool,
    pub is_base64: bool,
    pub device_model: String,
    /// Per-message destination override (command fan-out).
    pub dest_topic: Option<String>,
}

/// The variant-specific hooks of a processor. Stages return `false` to drop
/// the message; the runner's flow turns that into the right counter. Nothing
/// here may panic on malformed input.
pub trait Behavior: Send {
    fn flow(&self) -> Flow {
        Flow::Envelope
    }

    /// First look at the message: bump the variant counter, check the
    /// envelope and the type allow-list.
    fn assess(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool;

    fn validate(&mut self, core: &ProcessorCore, state: &mut MessageState) -> bool {
        core.validate_payload(state)
    }

    fn normalize(&mut self, _core: &ProcessorCore, _state: &mut MessageState) -> bool {
        true
    }

    /// Last touch on the outbound envelope after id/time/data are stamped.
    fn finalize_envelope(
        &self,
        _core: &ProcessorCore,
        _state: &MessageState,
        _envelope: &mut Map<String, Value>,
    ) {
    }

    /// Only meaningful for [`Flow::Assemble`] variants.
    fn assemble(&mut self, _core: &ProcessorCore, _msg: &InboundMessage) {}
}

/// A pipeline's processing stage: the shared core plus the variant hooks.
pub struct Processor {
    pub core: ProcessorCore,
    behavior: Box<dyn Behavior>,
}

impl Processor {
    /// Build a processor from its pipeline entry. Everything that can fail
    /// without touching a broker fails here.
    pub fn build(
        config: &ServiceConfig,
        pipeline: &PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Processor> {
        let behavior = create_behavior(&pipeline.class, pipeline)?;

        let Some(global_rules) = &config.global_validation_rules else {
            bail!("invalid global_validation_rules");
        };
        let rules = merge_rules(
            pipeline.validation_rules.clone(),
            global_rules,
            pipeline.apply_global_validation_rules,
        );

        let schema = match pipeline.json_schema.as_deref() {
            None => None,
            Some("") => {
                warn!("no json_schema file provided");
                None
            }
            Some(path) => {
                info!("json_schema({path})");
                let text = fs::read_to_string(path)
                    .with_context(|| format!("unable to read schema file {path}"))?;
                let value: Value = serde_json::from_str(&text)
                    .with_context(|| format!("invalid schema file {path}"))?;
                let validator = jsonschema::validator_for(&value)
                    .map_err(|e| anyhow::anyhow!("invalid schema in {path}: {e}"))?;
                Some(validator)
            }
        };

        let extra_config = match pipeline.config.as_deref().filter(|path| !path.is_empty()) {
            None => Map::new(),
            Some(path) => {
                info!("config_filename({path})");
                load_json_object(path)?
            }
        };

        let src_has_cloud_event = pipeline.source_broker.has_cloud_event;
        if !src_has_cloud_event {
            warn!("source broker for pipeline({}) does not carry cloud events", pipeline.name);
        }

        let dest_topic = pipeline
            .destination_broker
            .topic
            .as_ref()
            .and_then(|topics| topics.first())
            .map(str::to_owned);

        Ok(Processor {
            core: ProcessorCore {
                name: pipeline.name.clone(),
                device_id: String::new(),
                cloud_event: pipeline.cloud_event.clone(),
                schema,
                rules: RulesEngine::new(&rules),
                max_payload_size_bytes: pipeline.max_payload_size_bytes,
                dest_topic,
                src_has_cloud_event,
                config: extra_config,
                metrics,
            },
            behavior,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_behavior(&mut self, behavior: Box<dyn Behavior>) {
        self.behavior = behavior;
    }

    /// Run one message through size check, envelope detection, the variant
    /// stages, and publication. Every exit increments exactly one of the
    /// valid/invalid/error counters.
    pub fn handle(&mut self, msg: &InboundMessage, dst: &dyn Transport) {
        let core = &self.core;
        let metrics = &core.metrics;

        if core.max_payload_size_bytes > 0 && msg.size as u64 > core.max_payload_size_bytes {
            error!(
                "payload size({}) exceeds max_payload_size_bytes({}) from topic({})",
                msg.size, core.max_payload_size_bytes, msg.topic
            );
            metrics.rx_message_invalid.inc();
            metrics.rx_message_over_size.inc();
            return;
        }

        if self.behavior.flow() == Flow::Assemble {
            self.behavior.assemble(&self.core, msg);
            return;
        }

        let Payload::Json(payload) = &msg.payload else {
            error!("undecodable payload from topic({})", msg.topic);
            metrics.rx_message_invalid.inc();
            return;
        };

        let mut envelope = core.cloud_event.clone();
        let mut state = MessageState {
            msg,
            payload,
            data: None,
            compressed: false,
            is_base64: false,
            device_model: String::new(),
            dest_topic: None,
        };

        if core.src_has_cloud_event {
            envelope.insert(
                "source".to_owned(),
                payload.get("source").cloned().unwrap_or(Value::Null),
            );
            let compressed = payload
                .get("compressed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            envelope.insert("compressed".to_owned(), Value::Bool(compressed));
            state.compressed = compressed;
            state.is_base64 = payload.get("data_base64").is_some();
        } else {
            let no_source = envelope
                .get("source")
                .and_then(Value::as_str)
                .map(str::is_empty)
                .unwrap_or(true);
            if no_source {
                envelope.insert("source".to_owned(), Value::String(core.device_id.clone()));
            }
        }

        if !self.behavior.assess(&self.core, &mut state) {
            metrics.rx_message_invalid.inc();
            return;
        }
        if !self.behavior.validate(&self.core, &mut state) {
            metrics.rx_message_invalid.inc();
            return;
        }
        if !self.behavior.normalize(&self.core, &mut state) {
            metrics.rx_message_invalid.inc();
            return;
        }

        envelope.insert(
            "device_model".to_owned(),
            Value::String(state.device_model.clone()),
        );

        match self.behavior.flow() {
            Flow::Envelope => {
                let Some(data) = state.data.take() else {
                    metrics.rx_message_error.inc();
                    return;
                };
                metrics.rx_message_valid.inc();

                let dest_topic = state
                    .dest_topic
                    .clone()
                    .or_else(|| self.core.dest_topic.clone())
                    .filter(|topic| !topic.is_empty());
                let Some(topic) = dest_topic else {
                    error!("invalid destination topic");
                    return;
                };

                cloudevent::finalize(&mut envelope, data, state.is_base64);
                self.behavior.finalize_envelope(&self.core, &state, &mut envelope);

                let outbound = Value::Object(envelope);
                info!("topic({topic}) payload({:.300})", outbound.to_string());
                if dst.publish(&topic, &outbound) {
                    metrics.tx_message_total.inc();
                }
            }
            Flow::RawData => {
                let Some(data) = payload.get("data").cloned().filter(|d| !d.is_null()) else {
                    metrics.rx_message_error.inc();
                    return;
                };
                metrics.rx_message_valid.inc();

                let Some(topic) = self.core.dest_topic.clone().filter(|t| !t.is_empty()) else {
                    error!("invalid destination topic");
                    return;
                };

                info!("topic({topic}) payload({data})");
                let opts = PublishOptions {
                    retain: Some(true),
                    qos: None,
                };
                if dst.publish_opts(&topic, &data, opts) {
                    metrics.tx_message_total.inc();
                }
            }
            Flow::Passthrough => {
                let mut dest_topic = self.core.dest_topic.clone();
                if let Some(props) = &msg.props {
                    if let Some(from_props) = props.get("dest_topic") {
                        dest_topic = Some(from_props.clone());
                    }
                }
                if let Some(from_payload) = payload.get("dest_topic").and_then(Value::as_str) {
                    if !from_payload.is_empty() {
                        dest_topic = Some(from_payload.to_owned());
                    }
                }

                match dest_topic.filter(|topic| !topic.is_empty()) {
                    None => {
                        metrics.rx_message_error.inc();
                    }
                    Some(topic) => {
                        metrics.rx_message_valid.inc();
                        info!("topic({topic}) payload({:.300})", payload.to_string());
                        if dst.publish(&topic, payload) {
                            metrics.tx_message_total.inc();
                        }
                    }
                }
            }
            Flow::Assemble => unreachable!("assemble flows return before the staged path"),
        }
    }
}

/// Map a pipeline class tag to its behavior. Unknown tags fail pipeline
/// construction.
pub fn create_behavior(class: &str, pipeline: &PipelineConfig) -> Result<Box<dyn Behavior>> {
    match class.trim().to_lowercase().as_str() {
        "generic" => Ok(Box::new(generic::GenericBehavior::new(pipeline)?)),
        "egauge" => Ok(Box::new(egauge::EgaugeBehavior)),
        "zigbee" => Ok(Box::new(zigbee::ZigbeeBehavior::new())),
        "gdp" => Ok(Box::new(gdp::GdpBehavior)),
        "ibr" => Ok(Box::new(ibr::IbrBehavior)),
        "cloud2device" => Ok(Box::new(c2d::C2dBehavior)),
        "rci" => Ok(Box::new(rci::RciBehavior)),
        "rci_command" => Ok(Box::new(rci_command::RciCommandBehavior::new(pipeline)?)),
        "camera" => Ok(Box::new(camera::CameraBehavior::from_env(pipeline)?)),
        other => bail!("invalid class({other})"),
    }
}
