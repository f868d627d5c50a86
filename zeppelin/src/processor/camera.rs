use std::borrow::Cow;
use std::env;
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use photo_rebuilder::{BlobStore, IngestStore, Outcome, PhotoRebuilder};

use crate::config::PipelineConfig;
use crate::queue::{InboundMessage, Payload};

use super::{Behavior, Flow, MessageState, ProcessorCore};

const DEFAULT_PHOTO_TIMEOUT_MINUTES: i64 = 2;

/// Camera pipelines don't republish: each block-framed message feeds the
/// reassembly engine, and a completed image leaves through the photo stores
/// instead of a broker.
pub struct CameraBehavior {
    rebuilder: PhotoRebuilder,
}

impl CameraBehavior {
    pub fn from_env(_pipeline: &PipelineConfig) -> Result<Self> {
        let timeout_minutes = env::var("PHOTO_TIMEOUT_MINUTES")
            .ok()
            .and_then(|minutes| minutes.parse().ok())
            .unwrap_or(DEFAULT_PHOTO_TIMEOUT_MINUTES);

        let object_store = Arc::new(BlobStore::from_env()?);
        let analytics_store = Arc::new(IngestStore::from_env()?);

        Ok(Self::with_rebuilder(PhotoRebuilder::new(
            timeout_minutes,
            object_store,
            analytics_store,
        )))
    }

    pub fn with_rebuilder(rebuilder: PhotoRebuilder) -> Self {
        CameraBehavior { rebuilder }
    }
}

impl Behavior for CameraBehavior {
    fn flow(&self) -> Flow {
        Flow::Assemble
    }

    fn assess(&mut self, _core: &ProcessorCore, _state: &mut MessageState) -> bool {
        true
    }

    fn assemble(&mut self, core: &ProcessorCore, msg: &InboundMessage) {
        let metrics = &core.metrics;

        // hub-routed events name the sending device in their properties;
        // locally bridged ones fall back to this edge's identity
        let device_id = msg
            .props
            .as_ref()
            .and_then(|props| props.get("iothub-connection-device-id"))
            .cloned()
            .unwrap_or_else(|| core.device_id.clone());

        let body: Cow<'_, [u8]> = match &msg.payload {
            Payload::Raw(bytes) => Cow::Borrowed(bytes.as_slice()),
            Payload::Json(value) => Cow::Owned(value.to_string().into_bytes()),
        };

        match self
            .rebuilder
            .handle_event(&device_id, &body, msg.received_at)
        {
            Ok(Outcome::Initialized) | Ok(Outcome::Accumulated) => {
                metrics.rx_message_valid.inc();
            }
            Ok(Outcome::Completed) => {
                info!("photo completed for device({device_id})");
                metrics.rx_message_valid.inc();
                metrics.tx_message_total.inc();
            }
            Ok(Outcome::Orphaned) => {
                metrics.rx_message_invalid.inc();
                metrics.rx_message_discarded.inc();
            }
            Ok(Outcome::PersistFailed) => {
                metrics.rx_message_error.inc();
            }
            Err(e) => {
                error!("unparseable camera message from device({device_id}): {e}");
                metrics.rx_message_invalid.inc();
                metrics.rx_message_discarded.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use photo_rebuilder::{AnalyticsStore, ObjectStore, PhotoMetadata, PhotoRecord};
    use serde_json::json;

    use super::super::testing::{build_processor, CaptureTransport};
    use super::*;
    use crate::processor::Processor;

    struct MemoryStore {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ObjectStore for MemoryStore {
        fn put(&self, blob_name: &str, bytes: &[u8], _metadata: &PhotoMetadata) -> Option<String> {
            self.uploads
                .lock()
                .unwrap()
                .push((blob_name.to_owned(), bytes.to_vec()));
            Some(format!("mem://{blob_name}"))
        }
    }

    struct MemoryRows;

    impl AnalyticsStore for MemoryRows {
        fn insert_row(&self, _record: &PhotoRecord) -> bool {
            true
        }
    }

    fn camera_processor() -> (Processor, Arc<crate::metrics::Metrics>, Arc<MemoryStore>) {
        let (mut processor, metrics) = build_processor(
            json!({
                "name": "camera",
                "class": "generic",
                "source_broker": {"class": "Void", "topic": "camera", "has_cloud_event": false},
                "cloud_event": {}
            }),
            json!({}),
        );

        let store = Arc::new(MemoryStore {
            uploads: Mutex::new(Vec::new()),
        });
        let rebuilder = PhotoRebuilder::new(2, store.clone(), Arc::new(MemoryRows));
        processor.set_behavior(Box::new(CameraBehavior::with_rebuilder(rebuilder)));

        (processor, metrics, store)
    }

    fn block(kind: &str, number: u32, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!("{{\"data\":[{{\"type\":\"{kind}\",\"val\":\"{number} {} ", data.len())
                .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"}]}");
        body
    }

    #[test]
    fn blocks_flow_into_the_reassembly_engine() {
        let (mut processor, metrics, store) = camera_processor();
        let dst = CaptureTransport::new();

        // init frames are plain ASCII and decode as JSON; block frames stay raw
        let init = br#"{"data":[{"type":"DCAV","val":"2"}]}"#;
        let device_props =
            HashMap::from([("iothub-connection-device-id".to_owned(), "truck-7".to_owned())]);

        processor.handle(
            &InboundMessage::from_bytes("camera", init).with_props(device_props.clone()),
            &dst,
        );
        processor.handle(
            &InboundMessage::from_bytes("camera", &block("BCAV", 2, &[0x03, 0x04]))
                .with_props(device_props.clone()),
            &dst,
        );
        processor.handle(
            &InboundMessage::from_bytes("camera", &block("BCAV", 1, &[0x01, 0x02]))
                .with_props(device_props),
            &dst,
        );

        assert_eq!(metrics.rx_message_valid.get(), 3);
        assert_eq!(metrics.tx_message_total.get(), 1);

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let (name, bytes) = &uploads[0];
        assert!(name.starts_with("truck-7/"));
        assert_eq!(bytes, &vec![0x01, 0x02, 0x03, 0x04]);

        // nothing leaves through the destination broker
        assert!(dst.published().is_empty());
    }

    #[test]
    fn unparseable_frames_are_discarded() {
        let (mut processor, metrics, _store) = camera_processor();
        let dst = CaptureTransport::new();

        processor.handle(&InboundMessage::from_bytes("camera", b"not a frame"), &dst);

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert_eq!(metrics.rx_message_discarded.get(), 1);
    }

    #[test]
    fn orphan_blocks_are_discarded() {
        let (mut processor, metrics, _store) = camera_processor();
        let dst = CaptureTransport::new();

        processor.handle(
            &InboundMessage::from_bytes("camera", &block("BCAR", 1, &[0xaa])),
            &dst,
        );

        assert_eq!(metrics.rx_message_invalid.get(), 1);
        assert_eq!(metrics.rx_message_discarded.get(), 1);
    }
}
