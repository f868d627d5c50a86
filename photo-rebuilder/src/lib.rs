//! Reassembly of block-streamed camera images.
//!
//! Devices ship a JPEG as an init frame (`DCAV`/`DCAR`, announcing the block
//! count) followed by data frames (`BCAV`/`BCAR`) carrying raw binary blocks
//! inside a JSON-ish envelope. This crate parses those frames, accumulates the
//! blocks per device, camera and minute window, and persists the completed
//! image to an object store and an analytics table.

mod frame;
mod rebuilder;
mod state;
mod store;

pub use frame::{parse_frame, Camera, Frame, FrameError};
pub use rebuilder::{Outcome, PhotoRebuilder};
pub use state::{CompletedPhoto, PhotoStateManager};
pub use store::{
    blob_name, AnalyticsStore, BlobStore, IngestStore, ObjectStore, PhotoMetadata, PhotoRecord,
};
