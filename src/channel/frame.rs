//! Wire frame: `u32 LE length || u64 LE timestamp (unix micros) || payload`.

use crate::constants::FRAME_HEADER_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub timestamp_us: u64,
}

impl FrameHeader {
    pub fn new(len: usize, timestamp_us: u64) -> Self {
        Self {
            len: len as u32,
            timestamp_us,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[0..4]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[4..12]);
        Self {
            len: u32::from_le_bytes(len),
            timestamp_us: u64::from_le_bytes(ts),
        }
    }

    /// Total bytes the frame occupies in a channel.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.len as usize
    }
}
