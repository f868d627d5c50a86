use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::frame::{parse_frame, Frame, FrameError};
use crate::state::{CompletedPhoto, PhotoStateManager};
use crate::store::{blob_name, AnalyticsStore, ObjectStore, PhotoMetadata, PhotoRecord};

/// What handling one inbound camera event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An init frame created (or re-announced) an image.
    Initialized,
    /// A block was stored; the image is still incomplete.
    Accumulated,
    /// A block arrived with no matching image in the search window.
    Orphaned,
    /// The image completed and both stores accepted it.
    Completed,
    /// The image completed but persisting it failed; the entry stays in the
    /// map and will eventually be swept.
    PersistFailed,
}

/// Drives the reassembly state machine: parse the frame, update the per-key
/// state, persist completed images, sweep expired ones.
pub struct PhotoRebuilder {
    manager: PhotoStateManager,
    object_store: Arc<dyn ObjectStore>,
    analytics_store: Arc<dyn AnalyticsStore>,
}

impl PhotoRebuilder {
    pub fn new(
        timeout_minutes: i64,
        object_store: Arc<dyn ObjectStore>,
        analytics_store: Arc<dyn AnalyticsStore>,
    ) -> Self {
        PhotoRebuilder {
            manager: PhotoStateManager::new(timeout_minutes),
            object_store,
            analytics_store,
        }
    }

    /// Process one inbound camera message.
    ///
    /// Expired entries are swept opportunistically before the message is
    /// looked at, so a stalled image never blocks its minute window forever.
    pub fn handle_event(
        &self,
        device_id: &str,
        body: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Outcome, FrameError> {
        let expired = self.manager.cleanup_expired();
        if expired > 0 {
            info!("swept {expired} expired photos");
        }

        match parse_frame(body)? {
            Frame::Init {
                camera,
                total_blocks,
            } => {
                self.manager
                    .initialize(device_id, camera, total_blocks, timestamp);
                Ok(Outcome::Initialized)
            }
            Frame::Block {
                camera,
                number,
                size,
                data,
            } => {
                let Some(key) = self.manager.find_matching(device_id, camera, timestamp) else {
                    warn!("no initialized photo for device({device_id}) block({number})");
                    return Ok(Outcome::Orphaned);
                };

                match self.manager.add_block(&key, number, size, data) {
                    Some(photo) => {
                        if self.persist(&photo) {
                            self.manager.remove(&key);
                            Ok(Outcome::Completed)
                        } else {
                            Ok(Outcome::PersistFailed)
                        }
                    }
                    None => Ok(Outcome::Accumulated),
                }
            }
        }
    }

    /// Upload the image then record the row. The state entry may only go away
    /// after both succeeded.
    fn persist(&self, photo: &CompletedPhoto) -> bool {
        let name = blob_name(&photo.device_id, photo.camera, photo.first_timestamp);
        let metadata = PhotoMetadata {
            device_id: photo.device_id.clone(),
            camera_type: photo.camera.as_str().to_owned(),
            timestamp: photo.first_timestamp,
        };

        let Some(blob_url) = self.object_store.put(&name, &photo.data, &metadata) else {
            error!("object upload failed for photo({name})");
            return false;
        };

        let record = PhotoRecord {
            device_id: photo.device_id.clone(),
            camera_type: photo.camera.as_str().to_owned(),
            timestamp: photo.first_timestamp,
            blob_url,
            total_blocks: photo.total_blocks,
            file_size: photo.data.len(),
            ingestion_time: Utc::now(),
        };

        if !self.analytics_store.insert_row(&record) {
            error!("analytics insert failed for photo({name})");
            return false;
        }

        true
    }

    pub fn pending(&self) -> usize {
        self.manager.pending()
    }
}
