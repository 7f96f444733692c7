//! Default transport: a byte ring over the slot's data area.
//!
//! `head` and `tail` are monotonically increasing byte positions; the ring
//! index is `pos % capacity`. Frames may wrap around the end of the data area.
//! A frame that does not fit in the free space is refused whole.

use std::sync::atomic::Ordering;

use super::{ChannelOps, ChannelOptions, ChannelSlot, ChannelType, FrameHeader, RecvStatus, SendStatus};
use crate::constants::{CHANNEL_DATA_BYTES, FRAME_HEADER_LEN, MAX_FRAME};
use crate::{Error, Result};

pub struct RingOps;

impl ChannelOps for RingOps {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Ring
    }

    fn init(&self, slot: &ChannelSlot, options: &ChannelOptions) -> Result<()> {
        let ChannelOptions::Ring { queue_bytes } = *options else {
            return Err(Error::ChannelInitFailed("ring options expected"));
        };
        let queue_bytes = queue_bytes as usize;
        if !(MAX_FRAME..=CHANNEL_DATA_BYTES).contains(&queue_bytes) {
            return Err(Error::ChannelInitFailed("queue_bytes out of range"));
        }
        slot.control
            .capacity
            .store(queue_bytes as u32, Ordering::Relaxed);
        Ok(())
    }

    fn send(&self, slot: &ChannelSlot, timestamp_us: u64, bytes: &[u8]) -> Result<SendStatus> {
        let c = &slot.control;
        let capacity = c.capacity.load(Ordering::Relaxed) as u64;
        let need = (FRAME_HEADER_LEN + bytes.len()) as u64;
        if need > capacity {
            return Err(Error::InvalidArg("frame larger than channel"));
        }
        let tail = c.tail.load(Ordering::Relaxed);
        let head = c.head.load(Ordering::Acquire);
        let free = capacity - (tail - head);
        if need > free {
            return Ok(SendStatus::WouldBlock);
        }
        let header = FrameHeader::new(bytes.len(), timestamp_us).to_bytes();
        // SAFETY: [tail, tail + need) lies in the free region, which the
        // consumer does not read until the release store below.
        unsafe {
            write_wrapped(slot, capacity, tail, &header);
            write_wrapped(slot, capacity, tail + FRAME_HEADER_LEN as u64, bytes);
        }
        c.tail.store(tail + need, Ordering::Release);
        Ok(SendStatus::Sent)
    }

    fn receive(&self, slot: &ChannelSlot, buf: &mut [u8]) -> Result<RecvStatus> {
        let c = &slot.control;
        let capacity = c.capacity.load(Ordering::Relaxed) as u64;
        let head = c.head.load(Ordering::Relaxed);
        let tail = c.tail.load(Ordering::Acquire);
        if head == tail {
            return Ok(RecvStatus::Empty);
        }
        if tail - head < FRAME_HEADER_LEN as u64 {
            return Err(Error::Corrupt("truncated frame header"));
        }
        let mut raw = [0u8; FRAME_HEADER_LEN];
        // SAFETY: [head, tail) was published by the producer's release store.
        unsafe { read_wrapped(slot, capacity, head, &mut raw) };
        let header = FrameHeader::from_bytes(&raw);
        let len = header.len as usize;
        if (header.frame_len() as u64) > tail - head {
            return Err(Error::Corrupt("frame overruns tail"));
        }
        if len > buf.len() {
            return Err(Error::InvalidArg("receive buffer too small"));
        }
        unsafe {
            read_wrapped(
                slot,
                capacity,
                head + FRAME_HEADER_LEN as u64,
                &mut buf[..len],
            )
        };
        c.head
            .store(head + header.frame_len() as u64, Ordering::Release);
        Ok(RecvStatus::Frame {
            timestamp_us: header.timestamp_us,
            len,
        })
    }

    fn cleanup(&self, slot: &ChannelSlot) {
        slot.control.latch.notify_all();
    }
}

unsafe fn write_wrapped(slot: &ChannelSlot, capacity: u64, pos: u64, bytes: &[u8]) {
    let base = slot.data_ptr();
    let start = (pos % capacity) as usize;
    let first = bytes.len().min(capacity as usize - start);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), first);
    if first < bytes.len() {
        std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, bytes.len() - first);
    }
}

unsafe fn read_wrapped(slot: &ChannelSlot, capacity: u64, pos: u64, out: &mut [u8]) {
    let base = slot.data_ptr() as *const u8;
    let start = (pos % capacity) as usize;
    let first = out.len().min(capacity as usize - start);
    std::ptr::copy_nonoverlapping(base.add(start), out.as_mut_ptr(), first);
    if first < out.len() {
        std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
    }
}
