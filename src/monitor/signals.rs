//! Process signal dispositions for the monitor.
//!
//! Handlers only set bits in a static word; the monitor loop takes them.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

pub const REQ_RELOAD: u32 = 1;
pub const REQ_FAST: u32 = 2;
pub const REQ_SMART: u32 = 4;

static PENDING: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(signum: libc::c_int) {
    let bit = match signum {
        libc::SIGHUP => REQ_RELOAD,
        libc::SIGINT => REQ_FAST,
        libc::SIGTERM => REQ_SMART,
        _ => 0,
    };
    PENDING.fetch_or(bit, Ordering::SeqCst);
}

fn set_disposition(signum: libc::c_int, handler: libc::sighandler_t) -> Result<()> {
    // SAFETY: the sigaction struct is fully initialised before use and the
    // handler only touches an atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// SIGHUP reloads, SIGINT shuts down fast, SIGTERM shuts down smart.
/// SIGALRM, SIGPIPE and the user signals are ignored.
pub fn install_signal_handlers() -> Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        set_disposition(signum, handler)?;
    }
    for signum in [libc::SIGALRM, libc::SIGPIPE, libc::SIGUSR1, libc::SIGUSR2] {
        set_disposition(signum, libc::SIG_IGN)?;
    }
    // SAFETY: plain libc calls on a local, initialised set.
    unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        if libc::sigprocmask(libc::SIG_UNBLOCK, &all, std::ptr::null_mut()) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    log::debug!("monitor signal handlers installed");
    Ok(())
}

/// Takes and clears the requests raised by signals so far.
pub fn take_pending() -> u32 {
    PENDING.swap(0, Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn raise_for_test(bits: u32) {
    PENDING.fetch_or(bits, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_bits_are_taken_once() {
        raise_for_test(REQ_RELOAD | REQ_SMART);
        let taken = take_pending();
        assert_eq!(taken & (REQ_RELOAD | REQ_SMART), REQ_RELOAD | REQ_SMART);
        assert_eq!(take_pending() & REQ_RELOAD, 0);
    }
}
