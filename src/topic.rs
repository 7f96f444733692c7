//! Topic index: a shared open-addressing map from topic name to topic slot,
//! plus the array of [`TopicEntity`] slots and the `used` bitmap.
//!
//! Structural changes (create, reclaim, map insert/remove) happen only under
//! the global lock held exclusive; lookups need it at least shared. The
//! per-topic subscriber bitmaps are the exception: they are updated with
//! atomic word operations and read without the lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::bitmap::{self, Snapshot};
use crate::constants::{MAX_TOPICS, MAX_TOPIC_LEN, SUB_WORDS, TOPIC_MAP_BUCKETS, TOPIC_WORDS};
use crate::{Error, Result};

const NAME_BYTES: usize = 32;

const BUCKET_EMPTY: u32 = 0;
const BUCKET_USED: u32 = 1;
const BUCKET_TOMBSTONE: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RoutingMode {
    /// Each event goes to one subscriber, chosen round-robin.
    Anycast = 1,
    /// Each event goes to every subscriber.
    Multicast = 2,
}

impl RoutingMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RoutingMode::Anycast),
            2 => Some(RoutingMode::Multicast),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RoutingMode::Anycast => "anycast",
            RoutingMode::Multicast => "multicast",
        }
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "anycast" => Ok(RoutingMode::Anycast),
            "multicast" => Ok(RoutingMode::Multicast),
            _ => Err(Error::InvalidArg("routing mode must be anycast or multicast")),
        }
    }
}

/// Checks a topic name and returns its bytes.
pub fn validate_topic(name: &str) -> Result<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= MAX_TOPIC_LEN {
        return Err(Error::InvalidArg("topic length"));
    }
    if bytes.contains(&0) {
        return Err(Error::InvalidArg("topic contains NUL"));
    }
    Ok(bytes)
}

#[repr(C, align(64))]
pub struct TopicEntity {
    routing_mode: AtomicU32,
    cursor: AtomicU32,
    name_len: AtomicU32,
    _pad: u32,
    name: UnsafeCell<[u8; NAME_BYTES]>,
    pub subscribers: [AtomicU64; SUB_WORDS],
}

#[repr(C)]
pub struct TopicTable {
    pub used: [AtomicU64; TOPIC_WORDS],
    next_hint: AtomicU32,
    _pad: u32,
    pub entities: [TopicEntity; MAX_TOPICS],
}

#[repr(C)]
struct TopicBucket {
    state: AtomicU32,
    hash: AtomicU32,
    slot: AtomicU32,
    name_len: AtomicU32,
    name: UnsafeCell<[u8; NAME_BYTES]>,
}

#[repr(C)]
pub struct TopicMap {
    buckets: [TopicBucket; TOPIC_MAP_BUCKETS],
}

// SAFETY: the name cells are written only under the global lock held
// exclusive and read only under the global lock (shared or exclusive).
unsafe impl Sync for TopicEntity {}
unsafe impl Sync for TopicBucket {}

fn store_name(cell: &UnsafeCell<[u8; NAME_BYTES]>, len: &AtomicU32, name: &[u8]) {
    let mut buf = [0u8; NAME_BYTES];
    buf[..name.len()].copy_from_slice(name);
    // SAFETY: caller holds the global lock exclusive.
    unsafe { *cell.get() = buf };
    len.store(name.len() as u32, Ordering::Release);
}

fn name_matches(cell: &UnsafeCell<[u8; NAME_BYTES]>, len: &AtomicU32, name: &[u8]) -> bool {
    let stored = len.load(Ordering::Acquire) as usize;
    if stored != name.len() {
        return false;
    }
    // SAFETY: caller holds the global lock.
    let buf = unsafe { &*cell.get() };
    &buf[..stored] == name
}

fn load_name(cell: &UnsafeCell<[u8; NAME_BYTES]>, len: &AtomicU32) -> Vec<u8> {
    let stored = (len.load(Ordering::Acquire) as usize).min(NAME_BYTES);
    // SAFETY: caller holds the global lock.
    let buf = unsafe { &*cell.get() };
    buf[..stored].to_vec()
}

impl TopicEntity {
    pub fn routing_mode(&self) -> Option<RoutingMode> {
        RoutingMode::from_raw(self.routing_mode.load(Ordering::Acquire))
    }

    /// Atomically advances the round-robin cursor, returning the old value.
    pub fn advance_cursor(&self) -> u32 {
        self.cursor.fetch_add(1, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> Snapshot<SUB_WORDS> {
        Snapshot::load(&self.subscribers)
    }

    pub fn subscriber_count(&self) -> u32 {
        bitmap::count(&self.subscribers)
    }

    fn reset(&self) {
        self.routing_mode.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
        self.name_len.store(0, Ordering::Relaxed);
        // SAFETY: caller holds the global lock exclusive.
        unsafe { *self.name.get() = [0u8; NAME_BYTES] };
        bitmap::clear_all(&self.subscribers);
    }
}

/// Borrowed view over the two topic regions.
#[derive(Clone, Copy)]
pub struct TopicIndex<'a> {
    table: &'a TopicTable,
    map: &'a TopicMap,
}

impl<'a> TopicIndex<'a> {
    pub fn new(table: &'a TopicTable, map: &'a TopicMap) -> Self {
        Self { table, map }
    }

    pub fn entity(&self, slot: usize) -> &'a TopicEntity {
        &self.table.entities[slot]
    }

    pub fn is_live(&self, slot: usize) -> bool {
        slot < MAX_TOPICS && bitmap::test(&self.table.used, slot)
    }

    pub fn live_count(&self) -> u32 {
        bitmap::count(&self.table.used)
    }

    pub fn live_slots(&self) -> impl Iterator<Item = usize> + 'a {
        let table = self.table;
        (0..MAX_TOPICS).filter(move |&slot| bitmap::test(&table.used, slot))
    }

    /// Name of a live topic slot. Requires the global lock.
    pub fn name_of(&self, slot: usize) -> Option<String> {
        if !self.is_live(slot) {
            return None;
        }
        let entity = self.entity(slot);
        String::from_utf8(load_name(&entity.name, &entity.name_len)).ok()
    }

    /// Names currently in the hash map. Requires the global lock.
    pub fn mapped_count(&self) -> usize {
        self.map
            .buckets
            .iter()
            .filter(|b| b.state.load(Ordering::Acquire) == BUCKET_USED)
            .count()
    }

    /// Requires the global lock (shared is enough).
    pub fn lookup(&self, name: &[u8]) -> Option<usize> {
        let hash = crc32fast::hash(name);
        let start = hash as usize % TOPIC_MAP_BUCKETS;
        for i in 0..TOPIC_MAP_BUCKETS {
            let bucket = &self.map.buckets[(start + i) % TOPIC_MAP_BUCKETS];
            match bucket.state.load(Ordering::Acquire) {
                BUCKET_EMPTY => return None,
                BUCKET_USED
                    if bucket.hash.load(Ordering::Relaxed) == hash
                        && name_matches(&bucket.name, &bucket.name_len, name) =>
                {
                    return Some(bucket.slot.load(Ordering::Acquire) as usize);
                }
                _ => {}
            }
        }
        None
    }

    /// Finds `name`, creating it with `mode` on a miss. Requires the global
    /// lock exclusive.
    pub fn lookup_or_create(&self, name: &[u8], mode: RoutingMode) -> Result<usize> {
        if let Some(slot) = self.lookup(name) {
            if self.entity(slot).routing_mode() != Some(mode) {
                return Err(Error::RoutingMismatch);
            }
            return Ok(slot);
        }
        self.create(name, mode)
    }

    fn create(&self, name: &[u8], mode: RoutingMode) -> Result<usize> {
        let hint = self.table.next_hint.load(Ordering::Relaxed) as usize % MAX_TOPICS;
        let slot = bitmap::first_clear_from(&self.table.used, hint, MAX_TOPICS)
            .ok_or(Error::CapacityExceeded("topic index full"))?;
        let bucket = self
            .free_bucket(name)
            .ok_or(Error::CapacityExceeded("topic map full"))?;

        let entity = self.entity(slot);
        entity.reset();
        store_name(&entity.name, &entity.name_len, name);
        entity.routing_mode.store(mode as u32, Ordering::Release);

        let b = &self.map.buckets[bucket];
        store_name(&b.name, &b.name_len, name);
        b.hash.store(crc32fast::hash(name), Ordering::Relaxed);
        b.slot.store(slot as u32, Ordering::Release);
        b.state.store(BUCKET_USED, Ordering::Release);

        bitmap::set(&self.table.used, slot);
        self.table
            .next_hint
            .store(((slot + 1) % MAX_TOPICS) as u32, Ordering::Relaxed);
        log::debug!(
            "topic {} created in slot {slot} ({})",
            String::from_utf8_lossy(name),
            mode.name()
        );
        Ok(slot)
    }

    fn free_bucket(&self, name: &[u8]) -> Option<usize> {
        let start = crc32fast::hash(name) as usize % TOPIC_MAP_BUCKETS;
        (0..TOPIC_MAP_BUCKETS)
            .map(|i| (start + i) % TOPIC_MAP_BUCKETS)
            .find(|&idx| self.map.buckets[idx].state.load(Ordering::Acquire) != BUCKET_USED)
    }

    /// Removes a live topic from the map and frees its slot. Requires the
    /// global lock exclusive and an empty subscriber bitmap.
    pub fn reclaim(&self, slot: usize) -> bool {
        if !self.is_live(slot) {
            return false;
        }
        let entity = self.entity(slot);
        let name = load_name(&entity.name, &entity.name_len);
        self.remove_bucket(&name);
        entity.reset();
        bitmap::clear(&self.table.used, slot);
        log::debug!("topic {} reclaimed from slot {slot}", String::from_utf8_lossy(&name));
        true
    }

    fn remove_bucket(&self, name: &[u8]) {
        let hash = crc32fast::hash(name);
        let start = hash as usize % TOPIC_MAP_BUCKETS;
        for i in 0..TOPIC_MAP_BUCKETS {
            let idx = (start + i) % TOPIC_MAP_BUCKETS;
            let bucket = &self.map.buckets[idx];
            match bucket.state.load(Ordering::Acquire) {
                BUCKET_EMPTY => return,
                BUCKET_USED
                    if bucket.hash.load(Ordering::Relaxed) == hash
                        && name_matches(&bucket.name, &bucket.name_len, name) =>
                {
                    let next = &self.map.buckets[(idx + 1) % TOPIC_MAP_BUCKETS];
                    // A bucket with an empty successor ends no lookup chain.
                    let state = if next.state.load(Ordering::Acquire) == BUCKET_EMPTY {
                        BUCKET_EMPTY
                    } else {
                        BUCKET_TOMBSTONE
                    };
                    bucket.state.store(state, Ordering::Release);
                    bucket.name_len.store(0, Ordering::Relaxed);
                    return;
                }
                _ => {}
            }
        }
    }
}
