//! Compile-time limits of the shared region.
//!
//! Every table in the region is sized from these values, so changing one
//! changes the layout and requires bumping [`SHMEM_VERSION`].

use std::time::Duration;

/// Subscriber table capacity. Subscriber ids are dense in `[0, MAX_SUBS)`.
pub const MAX_SUBS: usize = 128;
/// Publisher table capacity. Publisher ids are dense in `[0, MAX_PUBS)`.
pub const MAX_PUBS: usize = 64;
/// Topic slot capacity.
pub const MAX_TOPICS: usize = 256;
/// Topic name storage including the terminator; valid names are `1..MAX_TOPIC_LEN` bytes.
pub const MAX_TOPIC_LEN: usize = 25;
/// Largest user payload carried by one event.
pub const MAX_PAYLOAD: usize = 64;
/// Hard cap for reliable publishes and for monitor draining.
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(300);

pub const SHMEM_MAGIC: u32 = 0x4D53_5331; // 'MSS1'
pub const SHMEM_VERSION: u32 = 2;

pub const SUB_WORDS: usize = (MAX_SUBS + 63) / 64;
pub const TOPIC_WORDS: usize = (MAX_TOPICS + 63) / 64;
pub const CHANNEL_SLOTS: usize = MAX_PUBS + MAX_SUBS;
pub const TOPIC_MAP_BUCKETS: usize = MAX_TOPICS * 2;

/// Bytes of ring storage behind each channel slot.
pub const CHANNEL_DATA_BYTES: usize = 4096;
pub const DEFAULT_QUEUE_BYTES: u32 = CHANNEL_DATA_BYTES as u32;

/// Wire frame prefix: `u32 length || u64 timestamp`.
pub const FRAME_HEADER_LEN: usize = 12;
/// Envelope prefix inside a frame payload: `u32 topic_key`.
pub const ENVELOPE_HEADER_LEN: usize = 4;
pub const MAX_ENVELOPE: usize = ENVELOPE_HEADER_LEN + MAX_PAYLOAD;
pub const MAX_FRAME: usize = FRAME_HEADER_LEN + MAX_ENVELOPE;

/// Marks an endpoint slot that is not held by anyone.
pub const SLOT_UNUSED: u32 = u32::MAX;
