//! Publisher and subscriber tables.
//!
//! Both tables are fixed arrays guarded by a table lock; every slot also has
//! its own lock. Membership changes walk the table with the table lock held
//! exclusive and try-lock each slot, skipping slots that are busy.
//!
//! Lock order is global → table → slot, never inverted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::bitmap::{self, Snapshot};
use crate::constants::{MAX_PUBS, MAX_SUBS, SLOT_UNUSED, TOPIC_WORDS};
use crate::lock::{ExclusiveGuard, ShmLock};
use crate::process::ProcessIdentity;
use crate::{Error, Result};

#[repr(C, align(64))]
pub struct SubscriberInfo {
    pub id: AtomicU32,
    pub owner_pid: AtomicU32,
    pub owner_start: AtomicU64,
    pub channel: AtomicU32,
    /// Bumped on every acquisition of the slot.
    pub generation: AtomicU32,
    pub lock: ShmLock,
    pub topics: [AtomicU64; TOPIC_WORDS],
}

#[repr(C, align(64))]
pub struct PublisherInfo {
    pub id: AtomicU32,
    pub owner_pid: AtomicU32,
    pub owner_start: AtomicU64,
    pub channel: AtomicU32,
    /// Bumped on every acquisition of the slot.
    pub generation: AtomicU32,
    pub lock: ShmLock,
}

#[repr(C)]
pub struct SubscriberTable {
    pub lock: ShmLock,
    pub slots: [SubscriberInfo; MAX_SUBS],
}

#[repr(C)]
pub struct PublisherTable {
    pub lock: ShmLock,
    pub slots: [PublisherInfo; MAX_PUBS],
}

/// Fields shared by both endpoint kinds.
pub trait EndpointSlot {
    fn id_word(&self) -> &AtomicU32;
    fn slot_lock(&self) -> &ShmLock;
    fn owner_words(&self) -> (&AtomicU32, &AtomicU64);
    fn channel_word(&self) -> &AtomicU32;
    fn generation_word(&self) -> &AtomicU32;

    fn reset(&self) {
        self.id_word().store(SLOT_UNUSED, Ordering::Relaxed);
        let (pid, start) = self.owner_words();
        pid.store(0, Ordering::Relaxed);
        start.store(0, Ordering::Relaxed);
        self.channel_word().store(SLOT_UNUSED, Ordering::Relaxed);
        self.generation_word().store(0, Ordering::Relaxed);
        self.slot_lock().reset();
    }

    fn generation(&self) -> u32 {
        self.generation_word().load(Ordering::Acquire)
    }

    fn id(&self) -> Option<usize> {
        match self.id_word().load(Ordering::Acquire) {
            SLOT_UNUSED => None,
            id => Some(id as usize),
        }
    }

    fn owner(&self) -> ProcessIdentity {
        let (pid, start) = self.owner_words();
        ProcessIdentity {
            pid: pid.load(Ordering::Acquire),
            start_time: start.load(Ordering::Acquire),
        }
    }

    fn channel(&self) -> Option<usize> {
        match self.channel_word().load(Ordering::Acquire) {
            SLOT_UNUSED => None,
            idx => Some(idx as usize),
        }
    }

    /// True while slot `index` is still the acquisition `generation` by `owner`.
    fn held_by(&self, index: usize, owner: &ProcessIdentity, generation: u32) -> bool {
        self.id() == Some(index) && self.owner() == *owner && self.generation() == generation
    }
}

impl EndpointSlot for SubscriberInfo {
    fn id_word(&self) -> &AtomicU32 {
        &self.id
    }
    fn slot_lock(&self) -> &ShmLock {
        &self.lock
    }
    fn owner_words(&self) -> (&AtomicU32, &AtomicU64) {
        (&self.owner_pid, &self.owner_start)
    }
    fn channel_word(&self) -> &AtomicU32 {
        &self.channel
    }
    fn generation_word(&self) -> &AtomicU32 {
        &self.generation
    }
}

impl EndpointSlot for PublisherInfo {
    fn id_word(&self) -> &AtomicU32 {
        &self.id
    }
    fn slot_lock(&self) -> &ShmLock {
        &self.lock
    }
    fn owner_words(&self) -> (&AtomicU32, &AtomicU64) {
        (&self.owner_pid, &self.owner_start)
    }
    fn channel_word(&self) -> &AtomicU32 {
        &self.channel
    }
    fn generation_word(&self) -> &AtomicU32 {
        &self.generation
    }
}

impl SubscriberInfo {
    pub fn subscribed(&self) -> Snapshot<TOPIC_WORDS> {
        Snapshot::load(&self.topics)
    }
}

/// A slot handed out by [`acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    pub index: usize,
    pub generation: u32,
}

/// Claims the first free slot for `owner` and runs `init` on it while the slot
/// lock is held. A failing `init` rolls the slot back, so no partial endpoint
/// survives. Caller holds the global lock and the table lock exclusive.
pub fn acquire<T: EndpointSlot>(
    slots: &[T],
    owner: ProcessIdentity,
    count: &AtomicU32,
    init: impl FnOnce(usize, &T) -> Result<()>,
) -> Result<Claim> {
    for (index, slot) in slots.iter().enumerate() {
        let Some(_guard) = slot.slot_lock().try_lock_exclusive() else {
            continue;
        };
        if slot.id().is_some() {
            continue;
        }
        let (pid, start) = slot.owner_words();
        pid.store(owner.pid, Ordering::Relaxed);
        start.store(owner.start_time, Ordering::Relaxed);
        if let Err(err) = init(index, slot) {
            pid.store(0, Ordering::Relaxed);
            start.store(0, Ordering::Relaxed);
            slot.channel_word().store(SLOT_UNUSED, Ordering::Relaxed);
            return Err(err);
        }
        let generation = slot
            .generation_word()
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        slot.id_word().store(index as u32, Ordering::Release);
        count.fetch_add(1, Ordering::AcqRel);
        return Ok(Claim { index, generation });
    }
    Err(Error::CapacityExceeded("endpoint table full"))
}

/// Returns a held slot to the free pool. Caller holds the global lock, the
/// table lock, and the slot lock (witnessed by `_slot_guard`).
pub fn release<T: EndpointSlot>(slot: &T, count: &AtomicU32, _slot_guard: &ExclusiveGuard<'_>) {
    if slot.id().is_none() {
        return;
    }
    slot.id_word().store(SLOT_UNUSED, Ordering::Release);
    let (pid, start) = slot.owner_words();
    pid.store(0, Ordering::Relaxed);
    start.store(0, Ordering::Relaxed);
    slot.channel_word().store(SLOT_UNUSED, Ordering::Relaxed);
    count.fetch_sub(1, Ordering::AcqRel);
}

/// Clears every topic bit of a subscriber. Returns the topics it held.
pub fn clear_subscriptions(info: &SubscriberInfo) -> Snapshot<TOPIC_WORDS> {
    let held = info.subscribed();
    bitmap::clear_all(&info.topics);
    held
}
