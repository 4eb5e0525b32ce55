//! Writing images onto removable media

pub mod device;
pub mod types;
pub mod writer;

pub use device::{list_block_devices, BlockDevice};
pub use types::{WriteProgress, WriteStatus};
pub use writer::{copy_image, BlockDeviceWriter, CopyOutcome, JobHandle, WriteJob};

/// Default copy chunk size (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
