use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Timelike, Utc};
use log::{info, warn};

use crate::frame::Camera;

#[derive(Debug, Clone)]
struct PhotoBlock {
    size: usize,
    data: Vec<u8>,
}

/// One image in flight: the announced block count and whatever blocks have
/// arrived so far, keyed by block number.
#[derive(Debug, Clone)]
struct PhotoState {
    device_id: String,
    camera: Camera,
    total_blocks: u32,
    first_timestamp: DateTime<Utc>,
    blocks: BTreeMap<u32, PhotoBlock>,
}

impl PhotoState {
    fn is_complete(&self) -> bool {
        self.blocks.len() as u32 == self.total_blocks
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.first_timestamp > timeout
    }

    /// Concatenation of all block data in ascending block-number order.
    fn sorted_data(&self) -> Vec<u8> {
        let capacity = self.blocks.values().map(|block| block.data.len()).sum();
        let mut buffer = Vec::with_capacity(capacity);
        for block in self.blocks.values() {
            buffer.extend_from_slice(&block.data);
        }
        buffer
    }
}

/// A fully reassembled image, ready to be persisted.
#[derive(Debug, Clone)]
pub struct CompletedPhoto {
    pub device_id: String,
    pub camera: Camera,
    pub total_blocks: u32,
    pub first_timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Tracks images under reassembly, keyed by device, camera and the minute
/// window of the announcing message. The map is shared between the receive
/// path and the expiration sweep, so every composite operation takes the lock
/// once and finishes under it.
pub struct PhotoStateManager {
    timeout: Duration,
    photos: Mutex<HashMap<String, PhotoState>>,
}

impl PhotoStateManager {
    pub fn new(timeout_minutes: i64) -> Self {
        PhotoStateManager {
            timeout: Duration::minutes(timeout_minutes),
            photos: Mutex::new(HashMap::new()),
        }
    }

    fn photo_key(device_id: &str, camera: Camera, timestamp: DateTime<Utc>) -> String {
        let window = timestamp
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(timestamp);
        format!("{}_{}_{}", device_id, camera, window.to_rfc3339())
    }

    /// Register a new image announced by an init frame. If an entry already
    /// exists for the key the first announcement wins and the new one is a
    /// no-op.
    pub fn initialize(
        &self,
        device_id: &str,
        camera: Camera,
        total_blocks: u32,
        timestamp: DateTime<Utc>,
    ) -> String {
        let key = Self::photo_key(device_id, camera, timestamp);
        let mut photos = self.photos.lock().expect("photo state lock poisoned");

        if !photos.contains_key(&key) {
            photos.insert(
                key.clone(),
                PhotoState {
                    device_id: device_id.to_owned(),
                    camera,
                    total_blocks,
                    first_timestamp: timestamp,
                    blocks: BTreeMap::new(),
                },
            );
            info!("photo({key}) initialized with {total_blocks} blocks");
        }

        key
    }

    /// Find the entry a block belongs to by probing the minute windows around
    /// its timestamp (current, ±1, ±2 minutes).
    pub fn find_matching(
        &self,
        device_id: &str,
        camera: Camera,
        timestamp: DateTime<Utc>,
    ) -> Option<String> {
        let photos = self.photos.lock().expect("photo state lock poisoned");

        for delta_minutes in -2i64..=2 {
            let probe = timestamp + Duration::minutes(delta_minutes);
            let key = Self::photo_key(device_id, camera, probe);
            if photos.contains_key(&key) {
                return Some(key);
            }
        }

        None
    }

    /// Store one block. Duplicate block numbers overwrite. Returns the
    /// completed photo once every announced block is present; the entry stays
    /// in the map until [`PhotoStateManager::remove`] so that a failed persist
    /// leaves it recoverable.
    pub fn add_block(
        &self,
        key: &str,
        number: u32,
        size: usize,
        data: Vec<u8>,
    ) -> Option<CompletedPhoto> {
        let mut photos = self.photos.lock().expect("photo state lock poisoned");

        let Some(photo) = photos.get_mut(key) else {
            warn!("photo({key}) not initialized, dropping block {number}");
            return None;
        };

        photo.blocks.insert(number, PhotoBlock { size, data });
        info!(
            "photo({key}) block {number}/{} stored",
            photo.total_blocks
        );

        if photo.is_complete() {
            info!("photo({key}) complete");
            return Some(CompletedPhoto {
                device_id: photo.device_id.clone(),
                camera: photo.camera,
                total_blocks: photo.total_blocks,
                first_timestamp: photo.first_timestamp,
                data: photo.sorted_data(),
            });
        }

        None
    }

    pub fn remove(&self, key: &str) {
        let mut photos = self.photos.lock().expect("photo state lock poisoned");
        if photos.remove(key).is_some() {
            info!("photo({key}) removed");
        }
    }

    /// Drop every entry whose first timestamp is older than the timeout.
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        self.sweep(Utc::now())
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut photos = self.photos.lock().expect("photo state lock poisoned");
        let expired: Vec<String> = photos
            .iter()
            .filter(|(_, photo)| photo.is_expired(now, self.timeout))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            warn!("photo({key}) expired, discarding partial image");
            photos.remove(key);
        }

        expired.len()
    }

    pub fn pending(&self) -> usize {
        self.photos.lock().expect("photo state lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn completes_in_block_number_order() {
        let manager = PhotoStateManager::new(2);
        let start = at(12, 0, 0);

        let key = manager.initialize("dev-1", Camera::Front, 3, start);
        assert!(manager.add_block(&key, 1, 2, vec![0x01, 0x02]).is_none());
        assert!(manager.add_block(&key, 3, 2, vec![0x05, 0x06]).is_none());

        let photo = manager
            .add_block(&key, 2, 2, vec![0x03, 0x04])
            .expect("third block should complete the photo");

        assert_eq!(photo.data, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(photo.total_blocks, 3);

        // the entry survives until the persist succeeds
        assert_eq!(manager.pending(), 1);
        manager.remove(&key);
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn first_announcement_wins() {
        let manager = PhotoStateManager::new(2);
        let start = at(12, 0, 10);

        let key = manager.initialize("dev-1", Camera::Front, 2, start);
        let again = manager.initialize("dev-1", Camera::Front, 99, at(12, 0, 40));
        assert_eq!(key, again);

        assert!(manager.add_block(&key, 1, 1, vec![0xaa]).is_none());
        assert!(manager
            .add_block(&key, 2, 1, vec![0xbb])
            .is_some_and(|photo| photo.total_blocks == 2));
    }

    #[test]
    fn duplicate_blocks_overwrite() {
        let manager = PhotoStateManager::new(2);
        let key = manager.initialize("dev-1", Camera::Rear, 1, at(9, 30, 0));

        let photo = manager
            .add_block(&key, 1, 1, vec![0x01])
            .expect("single block completes");
        assert_eq!(photo.data, vec![0x01]);

        let photo = manager
            .add_block(&key, 1, 1, vec![0x02])
            .expect("still complete after overwrite");
        assert_eq!(photo.data, vec![0x02]);
    }

    #[test]
    fn finds_entries_across_minute_windows() {
        let manager = PhotoStateManager::new(2);
        manager.initialize("dev-1", Camera::Front, 5, at(12, 0, 59));

        // a block arriving two minutes later still matches
        let found = manager.find_matching("dev-1", Camera::Front, at(12, 2, 5));
        assert!(found.is_some());

        // but not for another camera or device
        assert!(manager
            .find_matching("dev-1", Camera::Rear, at(12, 2, 5))
            .is_none());
        assert!(manager
            .find_matching("dev-2", Camera::Front, at(12, 2, 5))
            .is_none());

        // and not outside the window
        assert!(manager
            .find_matching("dev-1", Camera::Front, at(12, 30, 0))
            .is_none());
    }

    #[test]
    fn sweep_discards_expired_partials() {
        let manager = PhotoStateManager::new(2);
        let key = manager.initialize("dev-1", Camera::Front, 2, at(12, 0, 0));
        manager.add_block(&key, 1, 1, vec![0x01]);

        assert_eq!(manager.sweep(at(12, 1, 30)), 0);
        assert_eq!(manager.sweep(at(12, 2, 30)), 1);
        assert_eq!(manager.pending(), 0);

        // blocks for the vanished entry are dropped
        assert!(manager.add_block(&key, 2, 1, vec![0x02]).is_none());
    }
}
