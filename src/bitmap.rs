//! Dense-id membership bitmaps made of atomic 64-bit words.
//!
//! Writers only ever use `fetch_or` / `fetch_and(!bit)`, readers take word-wise
//! snapshots. A snapshot is not atomic across words; callers tolerate seeing a
//! concurrent change on one word and not on another.

use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
fn split(bit: usize) -> (usize, u64) {
    (bit / 64, 1u64 << (bit % 64))
}

/// Sets `bit`; returns true if it was previously clear.
pub fn set(words: &[AtomicU64], bit: usize) -> bool {
    let (word, mask) = split(bit);
    words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
}

/// Clears `bit`; returns true if it was previously set.
pub fn clear(words: &[AtomicU64], bit: usize) -> bool {
    let (word, mask) = split(bit);
    words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
}

pub fn test(words: &[AtomicU64], bit: usize) -> bool {
    let (word, mask) = split(bit);
    words[word].load(Ordering::Acquire) & mask != 0
}

pub fn clear_all(words: &[AtomicU64]) {
    for word in words {
        word.store(0, Ordering::Release);
    }
}

pub fn count(words: &[AtomicU64]) -> u32 {
    words
        .iter()
        .map(|w| w.load(Ordering::Acquire).count_ones())
        .sum()
}

/// Scans for a clear bit starting at `hint`, wrapping once. Bits at or above
/// `limit` are never returned.
pub fn first_clear_from(words: &[AtomicU64], hint: usize, limit: usize) -> Option<usize> {
    (0..limit)
        .map(|i| (hint + i) % limit)
        .find(|&bit| !test(words, bit))
}

/// A point-in-time copy of an atomic bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot<const N: usize> {
    words: [u64; N],
}

impl<const N: usize> Snapshot<N> {
    pub fn load(words: &[AtomicU64; N]) -> Self {
        let mut out = [0u64; N];
        for (dst, src) in out.iter_mut().zip(words.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        Self { words: out }
    }

    pub fn empty() -> Self {
        Self { words: [0; N] }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn contains(&self, bit: usize) -> bool {
        let (word, mask) = split(bit);
        self.words[word] & mask != 0
    }

    pub fn insert(&mut self, bit: usize) {
        let (word, mask) = split(bit);
        self.words[word] |= mask;
    }

    pub fn remove(&mut self, bit: usize) {
        let (word, mask) = split(bit);
        self.words[word] &= !mask;
    }

    /// Returns the `n`-th set bit in ascending order.
    pub fn nth(&self, mut n: u32) -> Option<usize> {
        for (idx, &word) in self.words.iter().enumerate() {
            let ones = word.count_ones();
            if n >= ones {
                n -= ones;
                continue;
            }
            let mut w = word;
            for _ in 0..n {
                w &= w - 1;
            }
            return Some(idx * 64 + w.trailing_zeros() as usize);
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(idx * 64 + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words<const N: usize>() -> [AtomicU64; N] {
        std::array::from_fn(|_| AtomicU64::new(0))
    }

    #[test]
    fn set_and_clear_report_transitions() {
        let bits = words::<2>();
        assert!(set(&bits, 70));
        assert!(!set(&bits, 70));
        assert!(test(&bits, 70));
        assert_eq!(count(&bits), 1);
        assert!(clear(&bits, 70));
        assert!(!clear(&bits, 70));
        assert_eq!(count(&bits), 0);
    }

    #[test]
    fn first_clear_wraps_from_hint() {
        let bits = words::<1>();
        for bit in 4..8 {
            set(&bits, bit);
        }
        assert_eq!(first_clear_from(&bits, 4, 8), Some(0));
        assert_eq!(first_clear_from(&bits, 2, 8), Some(2));
        for bit in 0..4 {
            set(&bits, bit);
        }
        assert_eq!(first_clear_from(&bits, 0, 8), None);
    }

    #[test]
    fn snapshot_nth_and_iter_agree() {
        let bits = words::<2>();
        for bit in [1, 63, 64, 100] {
            set(&bits, bit);
        }
        let snap = Snapshot::load(&bits);
        assert_eq!(snap.count(), 4);
        assert_eq!(snap.iter().collect::<Vec<_>>(), vec![1, 63, 64, 100]);
        assert_eq!(snap.nth(0), Some(1));
        assert_eq!(snap.nth(2), Some(64));
        assert_eq!(snap.nth(3), Some(100));
        assert_eq!(snap.nth(4), None);
    }
}
