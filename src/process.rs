//! Owner identity for endpoint slots.
//!
//! A pid alone is not enough to decide whether an endpoint's owner is still
//! around: pids are recycled. On Linux the identity also records the process
//! start time from `/proc/<pid>/stat`, and liveness requires both to match.

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::io::Read;

use serde::Serialize;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

impl ProcessIdentity {
    /// Identity of the calling process.
    pub fn current() -> Result<Self> {
        Self::of(std::process::id())
    }

    /// Identity of a running process, or an error if it does not exist.
    pub fn of(pid: u32) -> Result<Self> {
        let start_time = proc_start_time(pid)?;
        Ok(Self { pid, start_time })
    }

    pub fn is_alive(&self) -> bool {
        if self.pid == 0 {
            return false;
        }
        if !pid_exists(self.pid) {
            return false;
        }
        match proc_start_time(self.pid) {
            Ok(start) => start == self.start_time,
            Err(_) => false,
        }
    }
}

fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let res = unsafe { libc::kill(pid, 0) };
    if res == 0 {
        return true;
    }
    // EPERM still means the process exists.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    parse_start_time(&contents)
}

#[cfg(target_os = "linux")]
fn parse_start_time(stat: &str) -> Result<u64> {
    // The comm field may contain spaces and parens; fields resume after the last ')'.
    let end = stat.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    let mut fields = stat[end + 1..].split_whitespace();
    for _ in 0..19 {
        fields.next();
    }
    let start = fields
        .next()
        .ok_or(Error::Corrupt("stat missing starttime"))?;
    start
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(pid: u32) -> Result<u64> {
    if pid_exists(pid) {
        Ok(0)
    } else {
        Err(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
    }
}
