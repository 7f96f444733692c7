//! Shared/exclusive lock word for structures inside the region.
//!
//! The state word holds a reader count in the low bits and the writer bit on
//! top. Contended acquirers spin briefly, then park on the lock's latch; every
//! release notifies the latch when someone is parked. Parks are bounded so a
//! missed wake costs at most one park interval.
//!
//! The lock has no owner recovery: a process that dies while holding it wedges
//! the region, which is the supervisor's cue to reinitialise.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::wait::Latch;

const EXCLUSIVE: u32 = 1 << 31;
const SPIN_LIMIT: u32 = 64;
const PARK_INTERVAL: Duration = Duration::from_millis(10);

#[repr(C)]
pub struct ShmLock {
    state: AtomicU32,
    _pad: u32,
    latch: Latch,
}

pub struct SharedGuard<'a> {
    lock: &'a ShmLock,
}

pub struct ExclusiveGuard<'a> {
    lock: &'a ShmLock,
}

impl ShmLock {
    pub fn reset(&self) {
        self.state.store(0, Ordering::Relaxed);
        self.latch.reset();
    }

    pub fn try_lock_shared(&self) -> Option<SharedGuard<'_>> {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & EXCLUSIVE != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SharedGuard { lock: self }),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn try_lock_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        self.state
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExclusiveGuard { lock: self })
    }

    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.acquire(Self::try_lock_shared)
    }

    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire(Self::try_lock_exclusive)
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    fn acquire<'a, G>(&'a self, try_lock: impl Fn(&'a Self) -> Option<G>) -> G {
        for _ in 0..SPIN_LIMIT {
            if let Some(guard) = try_lock(self) {
                return guard;
            }
            std::hint::spin_loop();
        }
        loop {
            let token = self.latch.prepare();
            if let Some(guard) = try_lock(self) {
                self.latch.cancel(token);
                return guard;
            }
            if let Err(err) = self.latch.park(token, PARK_INTERVAL) {
                log::warn!("lock park failed: {err}");
            }
        }
    }

    fn release_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
        self.latch.notify();
    }

    fn release_exclusive(&self) {
        self.state.fetch_and(!EXCLUSIVE, Ordering::Release);
        self.latch.notify();
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
