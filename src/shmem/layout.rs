use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::channel::ChannelSlot;
use crate::constants::{CHANNEL_SLOTS, SHMEM_MAGIC, SHMEM_VERSION};
use crate::endpoint::{EndpointSlot, PublisherTable, SubscriberTable};
use crate::lock::ShmLock;
use crate::topic::{TopicIndex, TopicMap, TopicTable};
use crate::wait::Latch;
use crate::{Error, Result};

pub const INIT_EMPTY: u32 = 0;
pub const INIT_IN_PROGRESS: u32 = 1;
pub const INIT_READY: u32 = 2;

/// Indices into [`Header::extents`].
pub const EXTENT_GLOBAL_LOCK: usize = 0;
pub const EXTENT_SUBSCRIBERS: usize = 1;
pub const EXTENT_PUBLISHERS: usize = 2;
pub const EXTENT_TOPICS: usize = 3;
pub const EXTENT_TOPIC_MAP: usize = 4;
pub const EXTENT_CHANNELS: usize = 5;
pub const EXTENT_COUNT: usize = 6;

#[repr(C)]
pub struct Extent {
    pub offset: AtomicU64,
    pub size: AtomicU64,
}

#[repr(C, align(128))]
pub struct Header {
    // Written once by the initialiser.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub _pad0: u32,
    pub total_size: AtomicU64,
    pub extents: [Extent; EXTENT_COUNT],

    // Monitor lifecycle.
    pub monitor_state: AtomicU32,
    pub monitor_pid: AtomicU32,
    pub monitor_start: AtomicU64,
    /// Wakes the monitor loop (requests, in-flight drain).
    pub monitor_latch: Latch,

    // Membership counts, guarded by the global lock.
    pub subs_count: AtomicU32,
    pub pubs_count: AtomicU32,

    /// Publishes currently inside the API.
    pub inflight: AtomicU32,
    pub _pad1: u32,
    /// Bumped by subscribers after a consume while a reliable publisher waits.
    pub consume: Latch,
}

/// The whole shared region, in mapping order.
#[repr(C)]
pub struct ShmemLayout {
    pub header: Header,
    pub global: ShmLock,
    pub subscribers: SubscriberTable,
    pub publishers: PublisherTable,
    pub topics: TopicTable,
    pub topic_map: TopicMap,
    pub channels: [ChannelSlot; CHANNEL_SLOTS],
}

/// Total bytes of the shared region.
pub fn shmem_size() -> usize {
    size_of::<ShmemLayout>()
}

fn expected_extents() -> [(u64, u64); EXTENT_COUNT] {
    [
        (offset_of!(ShmemLayout, global) as u64, size_of::<ShmLock>() as u64),
        (
            offset_of!(ShmemLayout, subscribers) as u64,
            size_of::<SubscriberTable>() as u64,
        ),
        (
            offset_of!(ShmemLayout, publishers) as u64,
            size_of::<PublisherTable>() as u64,
        ),
        (offset_of!(ShmemLayout, topics) as u64, size_of::<TopicTable>() as u64),
        (offset_of!(ShmemLayout, topic_map) as u64, size_of::<TopicMap>() as u64),
        (
            offset_of!(ShmemLayout, channels) as u64,
            size_of::<[ChannelSlot; CHANNEL_SLOTS]>() as u64,
        ),
    ]
}

impl ShmemLayout {
    /// Initialises a zero-filled region. The header is published last.
    pub(crate) fn initialize(&self) {
        let h = &self.header;
        h.init_state.store(INIT_IN_PROGRESS, Ordering::Relaxed);
        h.version.store(SHMEM_VERSION, Ordering::Relaxed);
        h.total_size.store(shmem_size() as u64, Ordering::Relaxed);
        for (extent, (offset, size)) in h.extents.iter().zip(expected_extents()) {
            extent.offset.store(offset, Ordering::Relaxed);
            extent.size.store(size, Ordering::Relaxed);
        }
        self.global.reset();
        self.subscribers.lock.reset();
        for slot in self.subscribers.slots.iter() {
            slot.reset();
        }
        self.publishers.lock.reset();
        for slot in self.publishers.slots.iter() {
            slot.reset();
        }
        for slot in self.channels.iter() {
            slot.reset();
        }
        h.magic.store(SHMEM_MAGIC, Ordering::Relaxed);
        h.init_state.store(INIT_READY, Ordering::Release);
    }

    /// Checks magic, version and every extent against the compiled layout.
    pub(crate) fn validate(&self, mapped_len: usize) -> Result<()> {
        let h = &self.header;
        if h.magic.load(Ordering::Acquire) != SHMEM_MAGIC {
            return Err(Error::Corrupt("region magic mismatch"));
        }
        let version = h.version.load(Ordering::Acquire);
        if version != SHMEM_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let total = h.total_size.load(Ordering::Acquire);
        if total != shmem_size() as u64 || mapped_len < shmem_size() {
            return Err(Error::Corrupt("region size mismatch"));
        }
        for (extent, (offset, size)) in h.extents.iter().zip(expected_extents()) {
            if extent.offset.load(Ordering::Acquire) != offset
                || extent.size.load(Ordering::Acquire) != size
            {
                return Err(Error::Corrupt("region extent mismatch"));
            }
        }
        Ok(())
    }

    pub fn topic_index(&self) -> TopicIndex<'_> {
        TopicIndex::new(&self.topics, &self.topic_map)
    }

    /// Wakes every latch a client may be parked on.
    pub fn wake_all(&self) {
        for slot in self.channels.iter() {
            slot.control.latch.notify_all();
        }
        self.header.consume.notify_all();
        self.header.monitor_latch.notify_all();
    }
}
