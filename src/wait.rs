use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::Result;

#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT, SYS_futex};

    let mut ts = timespec { tv_sec: 0, tv_nsec: 0 };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    // FUTEX_WAIT (not the PRIVATE variant): the word lives in a shared mapping.
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::Error::Io(err)),
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, FUTEX_WAKE, SYS_futex};
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Polling stand-in for the futex: sleeps in short slices until the word
/// moves or `timeout` runs out.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    const SLICE: Duration = Duration::from_millis(1);
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    while addr.load(Ordering::Acquire) == expected {
        let slice = match deadline {
            Some(deadline) => {
                let now = std::time::Instant::now();
                if now >= deadline {
                    break;
                }
                (deadline - now).min(SLICE)
            }
            None => SLICE,
        };
        std::thread::sleep(slice);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}

/// A wakeup latch living in shared memory.
///
/// Waiters follow register / load sequence / re-check / park, so a notify that
/// lands between the re-check and the park is never lost: the futex compares
/// the sequence word before sleeping. Notifiers skip the syscall while nobody
/// is registered.
#[repr(C)]
pub struct Latch {
    seq: AtomicU32,
    waiters: AtomicU32,
}

/// Sequence observed at registration; consumed by `park` or `cancel`.
#[must_use]
pub struct LatchToken(u32);

impl Latch {
    pub fn reset(&self) {
        self.seq.store(0, Ordering::Relaxed);
        self.waiters.store(0, Ordering::Relaxed);
    }

    /// Registers the caller as a waiter. Re-check the wait condition after this.
    pub fn prepare(&self) -> LatchToken {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        LatchToken(self.seq.load(Ordering::Acquire))
    }

    /// Sleeps until notified or `timeout` elapses, then deregisters.
    pub fn park(&self, token: LatchToken, timeout: Duration) -> Result<()> {
        let res = futex_wait(&self.seq, token.0, Some(timeout));
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        res
    }

    /// Deregisters without sleeping (the condition was met on re-check).
    pub fn cancel(&self, token: LatchToken) {
        let _ = token;
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.notify_all();
    }

    /// Bumps the sequence and wakes regardless of registered waiters.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = futex_wake(&self.seq) {
            log::warn!("latch wake failed: {err}");
        }
    }

    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn latch() -> Arc<Latch> {
        Arc::new(Latch {
            seq: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        })
    }

    #[test]
    fn park_returns_after_timeout_without_notify() {
        let latch = latch();
        let start = Instant::now();
        let token = latch.prepare();
        latch.park(token, Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1));
        assert_eq!(latch.waiters(), 0);
    }

    #[test]
    fn wait_honours_the_full_timeout_on_an_unchanged_word() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        futex_wait(&word, 7, Some(Duration::from_millis(30))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_returns_at_once_on_a_moved_word() {
        let word = AtomicU32::new(8);
        let start = Instant::now();
        futex_wait(&word, 7, Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn notify_before_park_is_not_lost() {
        let latch = latch();
        let token = latch.prepare();
        latch.notify();
        let start = Instant::now();
        latch.park(token, Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn notify_wakes_parked_thread() {
        let latch = latch();
        let waiter = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            let token = waiter.prepare();
            let start = Instant::now();
            waiter.park(token, Duration::from_secs(5)).unwrap();
            start.elapsed()
        });
        while latch.waiters() == 0 {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(10));
        latch.notify();
        let waited = handle.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
