//! Bounded single-producer / single-consumer byte transports.
//!
//! Every endpoint owns one [`ChannelSlot`] in the region: publisher `p` owns
//! slot `p`, subscriber `s` owns slot `MAX_PUBS + s`. A slot is a control block
//! plus a fixed data area; how the data area is used depends on the transport
//! selected by the `channel_type` tag written at init.
//!
//! Transports implement [`ChannelOps`] and are reached through a static table
//! indexed by the tag, so callers never branch on the transport kind.
//!
//! ```text
//! ┌────────────── ChannelSlot ──────────────┐
//! │ control: tag | state | head | tail | …  │
//! │ data:    [u8; CHANNEL_DATA_BYTES]       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The subscriber side is the slot owner and the only consumer. Producers of a
//! subscriber channel are serialised by the subscriber's slot lock (see
//! `api::publish`), so the ring itself only ever sees one writer at a time.

pub mod frame;
pub mod mailbox;
pub mod ring;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::constants::{CHANNEL_DATA_BYTES, DEFAULT_QUEUE_BYTES, MAX_ENVELOPE, MAX_PUBS};
use crate::process::ProcessIdentity;
use crate::wait::Latch;
use crate::{Error, Result};

pub use frame::FrameHeader;

pub const STATE_FREE: u32 = 0;
pub const STATE_OPEN: u32 = 1;
pub const STATE_CLOSED: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelType {
    Ring = 0,
    Mailbox = 1,
}

impl ChannelType {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ChannelType::Ring),
            1 => Some(ChannelType::Mailbox),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelType::Ring => "ring",
            ChannelType::Mailbox => "mailbox",
        }
    }
}

/// Transport-specific options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOptions {
    /// Byte ring; `queue_bytes` must hold at least one maximal frame.
    Ring { queue_bytes: u32 },
    /// One frame in flight; `max_frame` bounds the frame payload.
    Mailbox { max_frame: u32 },
}

impl ChannelOptions {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelOptions::Ring { .. } => ChannelType::Ring,
            ChannelOptions::Mailbox { .. } => ChannelType::Mailbox,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel_type: ChannelType,
    pub options: ChannelOptions,
}

impl ChannelConfig {
    pub fn ring(queue_bytes: u32) -> Self {
        Self {
            channel_type: ChannelType::Ring,
            options: ChannelOptions::Ring { queue_bytes },
        }
    }

    pub fn mailbox() -> Self {
        Self {
            channel_type: ChannelType::Mailbox,
            options: ChannelOptions::Mailbox {
                max_frame: MAX_ENVELOPE as u32,
            },
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::ring(DEFAULT_QUEUE_BYTES)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    WouldBlock,
    PeerGone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvStatus {
    Frame { timestamp_us: u64, len: usize },
    Empty,
    PeerGone,
}

#[repr(C, align(128))]
pub struct ChannelControl {
    pub channel_type: AtomicU32,
    pub state: AtomicU32,
    /// Ring bytes or mailbox frame bound, fixed at init.
    pub capacity: AtomicU32,
    pub producer_pid: AtomicU32,
    pub consumer_pid: AtomicU32,
    pub _pad0: u32,
    pub consumer_start: AtomicU64,
    /// Consumer-owned read position.
    pub head: AtomicU64,
    /// Producer-owned write position.
    pub tail: AtomicU64,
    pub latch: Latch,
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub received: AtomicU64,
}

#[repr(C)]
pub struct ChannelSlot {
    pub control: ChannelControl,
    data: UnsafeCell<[u8; CHANNEL_DATA_BYTES]>,
}

// SAFETY: the data area is partitioned by head/tail. The producer writes only
// `[tail, head + capacity)` and publishes with a release store of `tail`; the
// consumer reads only `[head, tail)` after an acquire load.
unsafe impl Sync for ChannelSlot {}

impl ChannelSlot {
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    pub fn channel_type(&self) -> Option<ChannelType> {
        ChannelType::from_tag(self.control.channel_type.load(Ordering::Acquire))
    }

    pub fn state(&self) -> u32 {
        self.control.state.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.state() == STATE_OPEN
    }

    pub fn consumer(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.control.consumer_pid.load(Ordering::Acquire),
            start_time: self.control.consumer_start.load(Ordering::Acquire),
        }
    }

    /// Bytes (ring) or frames (mailbox) currently queued.
    pub fn backlog(&self) -> u64 {
        let tail = self.control.tail.load(Ordering::Acquire);
        let head = self.control.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    pub fn reset(&self) {
        let c = &self.control;
        c.channel_type.store(ChannelType::Ring.tag(), Ordering::Relaxed);
        c.state.store(STATE_FREE, Ordering::Relaxed);
        c.capacity.store(0, Ordering::Relaxed);
        c.producer_pid.store(0, Ordering::Relaxed);
        c.consumer_pid.store(0, Ordering::Relaxed);
        c.consumer_start.store(0, Ordering::Relaxed);
        c.head.store(0, Ordering::Relaxed);
        c.tail.store(0, Ordering::Relaxed);
        c.latch.reset();
        c.sent.store(0, Ordering::Relaxed);
        c.dropped.store(0, Ordering::Relaxed);
        c.received.store(0, Ordering::Relaxed);
    }
}

/// Per-transport operations.
pub trait ChannelOps: Sync {
    fn channel_type(&self) -> ChannelType;

    /// Validates `options` and writes the transport's control fields.
    fn init(&self, slot: &ChannelSlot, options: &ChannelOptions) -> Result<()>;

    /// Copies one whole frame in, or reports `WouldBlock` without writing.
    fn send(&self, slot: &ChannelSlot, timestamp_us: u64, bytes: &[u8]) -> Result<SendStatus>;

    /// Moves one frame into `buf`. A frame that does not fit stays queued.
    fn receive(&self, slot: &ChannelSlot, buf: &mut [u8]) -> Result<RecvStatus>;

    /// Releases transport-local resources and wakes a parked consumer.
    fn cleanup(&self, slot: &ChannelSlot);
}

static CHANNEL_OPS: [&dyn ChannelOps; 2] = [&ring::RingOps, &mailbox::MailboxOps];

pub fn ops_for(tag: u32) -> Option<&'static dyn ChannelOps> {
    CHANNEL_OPS.get(tag as usize).copied()
}

pub fn publisher_channel(pub_id: usize) -> usize {
    pub_id
}

pub fn subscriber_channel(sub_id: usize) -> usize {
    MAX_PUBS + sub_id
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Process-local attachment to one channel slot.
///
/// Resolves the transport once; the shared control block only carries the tag.
#[derive(Clone, Copy)]
pub struct ChannelHandle {
    index: usize,
    role: Role,
    ops: &'static dyn ChannelOps,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("index", &self.index)
            .field("role", &self.role)
            .field("type", &self.ops.channel_type())
            .finish()
    }
}

impl ChannelHandle {
    /// Initialises `slot` for `config` and attaches `owner` in `role`.
    pub fn init(
        index: usize,
        slot: &ChannelSlot,
        config: &ChannelConfig,
        role: Role,
        owner: ProcessIdentity,
    ) -> Result<Self> {
        if config.channel_type != config.options.channel_type() {
            return Err(Error::ChannelInitFailed("channel type does not match options"));
        }
        let ops = ops_for(config.channel_type.tag())
            .ok_or(Error::ChannelInitFailed("unknown channel type"))?;
        slot.reset();
        ops.init(slot, &config.options)?;
        let c = &slot.control;
        c.channel_type
            .store(config.channel_type.tag(), Ordering::Relaxed);
        match role {
            Role::Publisher => c.producer_pid.store(owner.pid, Ordering::Relaxed),
            Role::Subscriber => {
                c.consumer_pid.store(owner.pid, Ordering::Relaxed);
                c.consumer_start
                    .store(owner.start_time, Ordering::Relaxed);
            }
        }
        c.state.store(STATE_OPEN, Ordering::Release);
        Ok(Self { index, role, ops })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn channel_type(&self) -> ChannelType {
        self.ops.channel_type()
    }

    pub fn receive(&self, slot: &ChannelSlot, buf: &mut [u8]) -> Result<RecvStatus> {
        receive_with(self.ops, slot, buf)
    }

    pub fn close(&self, slot: &ChannelSlot) {
        close_with(self.ops, slot);
    }
}

/// Sends one frame into `slot` as its current producer.
///
/// The caller must hold the slot owner's slot lock so the channel keeps a
/// single producer.
pub fn send(slot: &ChannelSlot, timestamp_us: u64, bytes: &[u8]) -> Result<SendStatus> {
    if !slot.is_open() {
        return Ok(SendStatus::PeerGone);
    }
    let ops = ops_for(slot.control.channel_type.load(Ordering::Acquire))
        .ok_or(Error::Corrupt("channel type tag"))?;
    let status = ops.send(slot, timestamp_us, bytes)?;
    let c = &slot.control;
    match status {
        SendStatus::Sent => {
            c.sent.fetch_add(1, Ordering::Relaxed);
            c.latch.notify();
            Ok(SendStatus::Sent)
        }
        SendStatus::WouldBlock => {
            if !slot.consumer().is_alive() {
                return Ok(SendStatus::PeerGone);
            }
            c.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(SendStatus::WouldBlock)
        }
        SendStatus::PeerGone => Ok(SendStatus::PeerGone),
    }
}

fn receive_with(ops: &dyn ChannelOps, slot: &ChannelSlot, buf: &mut [u8]) -> Result<RecvStatus> {
    let status = ops.receive(slot, buf)?;
    match status {
        RecvStatus::Frame { .. } => {
            slot.control.received.fetch_add(1, Ordering::Relaxed);
            Ok(status)
        }
        RecvStatus::Empty if !slot.is_open() => Ok(RecvStatus::PeerGone),
        other => Ok(other),
    }
}

/// Marks the slot closed and runs the transport cleanup.
pub fn close(slot: &ChannelSlot) {
    match ops_for(slot.control.channel_type.load(Ordering::Acquire)) {
        Some(ops) => close_with(ops, slot),
        None => {
            slot.control.state.store(STATE_CLOSED, Ordering::Release);
            slot.control.latch.notify_all();
        }
    }
}

fn close_with(ops: &dyn ChannelOps, slot: &ChannelSlot) {
    slot.control.state.store(STATE_CLOSED, Ordering::Release);
    ops.cleanup(slot);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::MAX_FRAME;

    pub(crate) fn boxed_slot() -> Box<ChannelSlot> {
        // SAFETY: all-zero is a valid (free) slot, as in a fresh region.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    fn me() -> ProcessIdentity {
        ProcessIdentity::current().unwrap()
    }

    #[test]
    fn ops_table_is_indexed_by_tag() {
        for ty in [ChannelType::Ring, ChannelType::Mailbox] {
            assert_eq!(ops_for(ty.tag()).unwrap().channel_type(), ty);
        }
        assert!(ops_for(7).is_none());
    }

    #[test]
    fn mismatched_config_fails_init() {
        let slot = boxed_slot();
        let config = ChannelConfig {
            channel_type: ChannelType::Mailbox,
            options: ChannelOptions::Ring { queue_bytes: 1024 },
        };
        let err = ChannelHandle::init(0, &slot, &config, Role::Subscriber, me()).unwrap_err();
        assert!(matches!(err, Error::ChannelInitFailed(_)));
    }

    #[test]
    fn closed_channel_reports_peer_gone_both_ways() {
        let slot = boxed_slot();
        let handle =
            ChannelHandle::init(3, &slot, &ChannelConfig::default(), Role::Subscriber, me())
                .unwrap();
        assert_eq!(send(&slot, 1, b"abc").unwrap(), SendStatus::Sent);
        handle.close(&slot);
        assert_eq!(send(&slot, 2, b"def").unwrap(), SendStatus::PeerGone);

        let mut buf = [0u8; MAX_FRAME];
        // Already-queued frames still drain after close.
        assert!(matches!(
            handle.receive(&slot, &mut buf).unwrap(),
            RecvStatus::Frame { len: 3, .. }
        ));
        assert_eq!(handle.receive(&slot, &mut buf).unwrap(), RecvStatus::PeerGone);
    }

    #[test]
    fn full_channel_with_dead_consumer_is_peer_gone() {
        let slot = boxed_slot();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let owner = ProcessIdentity::of(child.id()).unwrap_or(ProcessIdentity {
            pid: child.id(),
            start_time: 0,
        });
        child.wait().unwrap();
        ChannelHandle::init(
            0,
            &slot,
            &ChannelConfig::ring(MAX_FRAME as u32),
            Role::Subscriber,
            owner,
        )
        .unwrap();
        let payload = [7u8; MAX_FRAME - crate::constants::FRAME_HEADER_LEN];
        assert_eq!(send(&slot, 0, &payload).unwrap(), SendStatus::Sent);
        assert_eq!(send(&slot, 0, &payload).unwrap(), SendStatus::PeerGone);
    }
}
