//! The monitor: a singleton supervisor loop over the shared region.
//!
//! It owns the lifecycle state in the region header, reclaims endpoints of
//! dead processes, and turns shutdown requests into a drain:
//!
//! ```text
//! Starting ──► Running ──(fast | smart)──► Draining ──► Stopped
//!                 ▲  │
//!                 └──┘ reload, gc
//! ```
//!
//! While draining, new publishes fail with `Shutdown` and blocked receives
//! return `Shutdown`. A smart shutdown waits up to `drain_timeout` for
//! in-flight publishes; a fast one stops at once.

pub mod config;
pub mod gc;
pub mod signals;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::process::ProcessIdentity;
use crate::shmem::Region;
use crate::{Error, Result};

pub use config::MonitorConfig;
pub use gc::GcReport;
pub use signals::{install_signal_handlers, REQ_FAST, REQ_RELOAD, REQ_SMART};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum MonitorState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl MonitorState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => MonitorState::Starting,
            1 => MonitorState::Running,
            2 => MonitorState::Draining,
            _ => MonitorState::Stopped,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Draining => "draining",
            MonitorState::Stopped => "stopped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop without waiting for in-flight publishes.
    Fast,
    /// Wait for in-flight publishes, bounded by `drain_timeout`.
    Smart,
}

/// Requests a running monitor from another thread.
#[derive(Clone)]
pub struct MonitorHandle {
    region: Arc<Region>,
    requests: Arc<AtomicU32>,
}

impl MonitorHandle {
    pub fn request_shutdown(&self, mode: ShutdownMode) {
        let bit = match mode {
            ShutdownMode::Fast => REQ_FAST,
            ShutdownMode::Smart => REQ_SMART,
        };
        self.raise(bit);
    }

    pub fn request_reload(&self) {
        self.raise(REQ_RELOAD);
    }

    fn raise(&self, bit: u32) {
        self.requests.fetch_or(bit, Ordering::AcqRel);
        self.region.header().monitor_latch.notify_all();
    }
}

#[derive(Clone, Debug, Default)]
pub struct MonitorReport {
    pub gc_passes: u64,
    pub reclaimed_subs: u64,
    pub reclaimed_pubs: u64,
    pub drained_topics: u64,
    pub reloads: u32,
    pub shutdown: Option<ShutdownMode>,
    /// False when the drain gave up with publishes still in flight.
    pub drained_cleanly: bool,
}

pub struct Monitor {
    region: Arc<Region>,
    config: MonitorConfig,
    config_path: Option<PathBuf>,
    requests: Arc<AtomicU32>,
    use_signals: bool,
    last_gc: Option<Instant>,
    report: MonitorReport,
}

impl Monitor {
    pub fn new(region: Arc<Region>, config: MonitorConfig) -> Self {
        Self {
            region,
            config,
            config_path: None,
            requests: Arc::new(AtomicU32::new(0)),
            use_signals: false,
            last_gc: None,
            report: MonitorReport::default(),
        }
    }

    /// File re-read on every reload request.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Also takes requests raised by [`install_signal_handlers`].
    pub fn with_signals(mut self) -> Self {
        self.use_signals = true;
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            region: Arc::clone(&self.region),
            requests: Arc::clone(&self.requests),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Runs one GC pass now.
    pub fn collect_garbage(&mut self) -> GcReport {
        let report = gc::sweep(self.region.layout(), self.config.drain_empty_topics);
        self.last_gc = Some(Instant::now());
        self.report.gc_passes += 1;
        self.report.reclaimed_subs += report.reclaimed_subs as u64;
        self.report.reclaimed_pubs += report.reclaimed_pubs as u64;
        self.report.drained_topics += report.drained_topics as u64;
        report
    }

    /// Runs until a shutdown request has been drained.
    pub fn run(mut self) -> Result<MonitorReport> {
        self.claim()?;
        self.region.set_monitor_state(MonitorState::Running);
        log::info!(
            "monitor running on {} (gc every {:?})",
            self.region.path().display(),
            self.config.gc_interval()
        );

        let result = self.serve();
        let mode = match &result {
            Ok(mode) => *mode,
            Err(err) => {
                log::error!("monitor loop failed: {err}");
                ShutdownMode::Fast
            }
        };
        self.drain(mode);
        self.release();
        result.map(|_| self.report)
    }

    fn claim(&self) -> Result<()> {
        let header = self.region.header();
        let me = ProcessIdentity::current()?;
        let current = header.monitor_pid.load(Ordering::Acquire);
        if current != 0 {
            let holder = ProcessIdentity {
                pid: current,
                start_time: header.monitor_start.load(Ordering::Acquire),
            };
            if holder.is_alive() {
                return Err(Error::CapacityExceeded("monitor already running"));
            }
            log::warn!("taking over from dead monitor pid {current}");
        }
        header
            .monitor_pid
            .compare_exchange(current, me.pid, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::CapacityExceeded("monitor already running"))?;
        header.monitor_start.store(me.start_time, Ordering::Release);
        self.region.set_monitor_state(MonitorState::Starting);
        Ok(())
    }

    fn release(&self) {
        let header = self.region.header();
        header.monitor_start.store(0, Ordering::Release);
        header.monitor_pid.store(0, Ordering::Release);
        if let Err(err) = self.region.flush_async() {
            log::warn!("region flush failed: {err}");
        }
    }

    fn take_requests(&self) -> u32 {
        let mut bits = self.requests.swap(0, Ordering::AcqRel);
        if self.use_signals {
            bits |= signals::take_pending();
        }
        bits
    }

    fn serve(&mut self) -> Result<ShutdownMode> {
        let region = Arc::clone(&self.region);
        let latch = &region.header().monitor_latch;
        loop {
            let requests = self.take_requests();
            if requests & REQ_RELOAD != 0 {
                self.reload();
            }
            if requests & REQ_FAST != 0 {
                return Ok(ShutdownMode::Fast);
            }
            if requests & REQ_SMART != 0 {
                return Ok(ShutdownMode::Smart);
            }
            if self.gc_due() {
                self.collect_garbage();
            }
            let token = latch.prepare();
            if self.requests.load(Ordering::Acquire) != 0 {
                latch.cancel(token);
                continue;
            }
            latch.park(token, self.config.tick())?;
        }
    }

    fn gc_due(&self) -> bool {
        self.last_gc
            .map_or(true, |at| at.elapsed() >= self.config.gc_interval())
    }

    fn reload(&mut self) {
        self.report.reloads += 1;
        let Some(path) = &self.config_path else {
            log::info!("reload requested; no config file, keeping current settings");
            return;
        };
        match MonitorConfig::load(path) {
            Ok(config) => {
                log::info!("monitor config reloaded from {}", path.display());
                self.config = config;
            }
            Err(err) => log::warn!("config reload failed, keeping previous: {err}"),
        }
    }

    fn drain(&mut self, mode: ShutdownMode) {
        let region = Arc::clone(&self.region);
        let header = region.header();
        let layout = region.layout();
        region.set_monitor_state(MonitorState::Draining);
        layout.wake_all();
        log::info!("monitor draining ({mode:?})");

        let grace = match mode {
            ShutdownMode::Fast => Duration::ZERO,
            ShutdownMode::Smart => self.config.drain_timeout(),
        };
        let deadline = Instant::now() + grace;
        let mut clean = false;
        loop {
            let inflight = header.inflight.load(Ordering::Acquire);
            if inflight == 0 {
                clean = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("drain gave up with {inflight} publishes in flight");
                break;
            }
            if self.take_requests() & REQ_FAST != 0 {
                log::info!("fast shutdown requested during drain");
                break;
            }
            let token = header.monitor_latch.prepare();
            if header.inflight.load(Ordering::Acquire) == 0 {
                header.monitor_latch.cancel(token);
                continue;
            }
            let park = self.config.tick().min(deadline - now);
            if let Err(err) = header.monitor_latch.park(token, park) {
                log::warn!("drain park failed: {err}");
                break;
            }
        }

        region.set_monitor_state(MonitorState::Stopped);
        layout.wake_all();
        self.report.shutdown = Some(mode);
        self.report.drained_cleanly = clean;
        log::info!("monitor stopped");
    }
}
