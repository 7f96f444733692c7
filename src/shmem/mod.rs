//! The shared region: one file-backed mapping holding every MSS table.
//!
//! The supervisor creates and initialises the region exactly once
//! ([`Region::create`]); every other process maps it with [`Region::open`].
//! Creation initialises a temporary file and renames it into place, so an
//! opener never observes a half-built region.
//!
//! ```text
//! ┌────────┬────────┬──────────────┬─────────────┬─────────────┬───────────┬──────────┐
//! │ header │ global │ subscribers  │ publishers  │ topics +    │ topic map │ channels │
//! │        │ lock   │ lock + slots │ lock+ slots │ used bitmap │           │          │
//! └────────┴────────┴──────────────┴─────────────┴─────────────┴───────────┴──────────┘
//! ```

pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::mmap::MmapFile;
use crate::monitor::MonitorState;
use crate::{Error, Result};

pub use layout::{shmem_size, Header, ShmemLayout, INIT_READY};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Region {
    mmap: MmapFile,
    ptr: *const ShmemLayout,
    path: PathBuf,
}

// SAFETY: every shared field is an atomic or an UnsafeCell whose access is
// serialised by the region's locks; the mapping lives as long as `Region`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates and initialises a fresh region at `path` (`shmem_init`).
    ///
    /// Any existing file at `path` is replaced.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");
        let mut mmap = MmapFile::create(&tmp_path, shmem_size())?;
        let ptr = mmap.as_mut_ptr() as *const ShmemLayout;
        let region = Self {
            mmap,
            ptr,
            path: path.clone(),
        };
        region.check_alignment()?;
        region.layout().initialize();
        std::fs::rename(&tmp_path, &path)?;
        log::info!(
            "mss region created at {} ({} bytes)",
            path.display(),
            shmem_size()
        );
        Ok(region)
    }

    /// Maps an existing region and validates its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut mmap = MmapFile::open(&path)?;
        if mmap.len() < shmem_size() {
            return Err(Error::Corrupt("region file too small"));
        }
        let ptr = mmap.as_mut_ptr() as *const ShmemLayout;
        let region = Self { mmap, ptr, path };
        region.check_alignment()?;
        region.wait_ready()?;
        region.layout().validate(region.mmap.len())?;
        Ok(region)
    }

    fn check_alignment(&self) -> Result<()> {
        if self.ptr as usize % std::mem::align_of::<ShmemLayout>() != 0 {
            return Err(Error::Corrupt("region mapping misaligned"));
        }
        Ok(())
    }

    fn wait_ready(&self) -> Result<()> {
        let start = Instant::now();
        while self.layout().header.init_state.load(Ordering::Acquire) != INIT_READY {
            if start.elapsed() >= READY_TIMEOUT {
                return Err(Error::Corrupt("region never became ready"));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    pub fn layout(&self) -> &ShmemLayout {
        // SAFETY: the mapping is at least `shmem_size()` bytes, suitably
        // aligned (checked on construction) and outlives the borrow.
        unsafe { &*self.ptr }
    }

    pub fn header(&self) -> &Header {
        &self.layout().header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn monitor_state(&self) -> MonitorState {
        MonitorState::from_raw(self.header().monitor_state.load(Ordering::Acquire))
    }

    /// True once the monitor has begun draining or has stopped.
    pub fn shutting_down(&self) -> bool {
        matches!(
            self.monitor_state(),
            MonitorState::Draining | MonitorState::Stopped
        )
    }

    pub(crate) fn set_monitor_state(&self, state: MonitorState) {
        self.header()
            .monitor_state
            .store(state as u32, Ordering::Release);
    }

    pub fn flush_async(&self) -> Result<()> {
        self.mmap.flush_async()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SHMEM_MAGIC, SLOT_UNUSED};
    use tempfile::tempdir;

    #[test]
    fn create_then_open_shares_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mss.region");
        let created = Region::create(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        let opened = Region::open(&path).unwrap();
        assert_eq!(opened.header().magic.load(Ordering::Relaxed), SHMEM_MAGIC);
        assert_eq!(
            opened.layout().subscribers.slots[5].id.load(Ordering::Relaxed),
            SLOT_UNUSED
        );
        created.header().subs_count.store(3, Ordering::Release);
        assert_eq!(opened.header().subs_count.load(Ordering::Acquire), 3);
        assert_eq!(opened.monitor_state(), MonitorState::Starting);
    }

    #[test]
    fn open_rejects_bad_magic_and_short_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mss.region");
        let region = Region::create(&path).unwrap();
        region.header().magic.store(0xDEAD_BEEF, Ordering::Release);
        assert!(matches!(Region::open(&path), Err(Error::Corrupt(_))));

        let short = dir.path().join("short.region");
        std::fs::write(&short, [0u8; 128]).unwrap();
        assert!(matches!(Region::open(&short), Err(Error::Corrupt(_))));
    }

    #[test]
    fn open_rejects_other_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mss.region");
        let region = Region::create(&path).unwrap();
        region.header().version.store(99, Ordering::Release);
        assert!(matches!(
            Region::open(&path),
            Err(Error::UnsupportedVersion(99))
        ));
    }
}
