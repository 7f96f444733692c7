//! Single-frame transport.
//!
//! `head`/`tail` count frames instead of bytes; the mailbox is full while
//! `tail != head`. The frame always sits at offset 0 of the data area.

use std::sync::atomic::Ordering;

use super::{ChannelOps, ChannelOptions, ChannelSlot, ChannelType, FrameHeader, RecvStatus, SendStatus};
use crate::constants::{CHANNEL_DATA_BYTES, FRAME_HEADER_LEN};
use crate::{Error, Result};

pub struct MailboxOps;

impl ChannelOps for MailboxOps {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Mailbox
    }

    fn init(&self, slot: &ChannelSlot, options: &ChannelOptions) -> Result<()> {
        let ChannelOptions::Mailbox { max_frame } = *options else {
            return Err(Error::ChannelInitFailed("mailbox options expected"));
        };
        if max_frame == 0 || max_frame as usize > CHANNEL_DATA_BYTES - FRAME_HEADER_LEN {
            return Err(Error::ChannelInitFailed("max_frame out of range"));
        }
        slot.control.capacity.store(max_frame, Ordering::Relaxed);
        Ok(())
    }

    fn send(&self, slot: &ChannelSlot, timestamp_us: u64, bytes: &[u8]) -> Result<SendStatus> {
        let c = &slot.control;
        if bytes.len() > c.capacity.load(Ordering::Relaxed) as usize {
            return Err(Error::InvalidArg("frame larger than mailbox"));
        }
        let tail = c.tail.load(Ordering::Relaxed);
        if c.head.load(Ordering::Acquire) != tail {
            return Ok(SendStatus::WouldBlock);
        }
        let header = FrameHeader::new(bytes.len(), timestamp_us).to_bytes();
        // SAFETY: the mailbox is empty, so the consumer is not reading it.
        unsafe {
            let base = slot.data_ptr();
            std::ptr::copy_nonoverlapping(header.as_ptr(), base, FRAME_HEADER_LEN);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(FRAME_HEADER_LEN), bytes.len());
        }
        c.tail.store(tail + 1, Ordering::Release);
        Ok(SendStatus::Sent)
    }

    fn receive(&self, slot: &ChannelSlot, buf: &mut [u8]) -> Result<RecvStatus> {
        let c = &slot.control;
        let head = c.head.load(Ordering::Relaxed);
        if c.tail.load(Ordering::Acquire) == head {
            return Ok(RecvStatus::Empty);
        }
        let mut raw = [0u8; FRAME_HEADER_LEN];
        let base = slot.data_ptr() as *const u8;
        // SAFETY: the frame was published by the producer's release store.
        unsafe { std::ptr::copy_nonoverlapping(base, raw.as_mut_ptr(), FRAME_HEADER_LEN) };
        let header = FrameHeader::from_bytes(&raw);
        let len = header.len as usize;
        if len > CHANNEL_DATA_BYTES - FRAME_HEADER_LEN {
            return Err(Error::Corrupt("mailbox frame length"));
        }
        if len > buf.len() {
            return Err(Error::InvalidArg("receive buffer too small"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(FRAME_HEADER_LEN), buf.as_mut_ptr(), len)
        };
        c.head.store(head + 1, Ordering::Release);
        Ok(RecvStatus::Frame {
            timestamp_us: header.timestamp_us,
            len,
        })
    }

    fn cleanup(&self, slot: &ChannelSlot) {
        slot.control.latch.notify_all();
    }
}
