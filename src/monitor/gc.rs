//! Reclaims endpoints whose owner process has died, and topics nobody
//! subscribes to any more.
//!
//! The sweep only ever try-locks. Anything busy is left for the next pass, so
//! the monitor never blocks behind a client.

use crate::api::{release_publisher, release_subscriber};
use crate::endpoint::EndpointSlot;
use crate::shmem::ShmemLayout;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub reclaimed_subs: u32,
    pub reclaimed_pubs: u32,
    pub drained_topics: u32,
    /// Locks that were busy; their targets wait for the next pass.
    pub skipped_busy: u32,
}

impl GcReport {
    pub fn is_noop(&self) -> bool {
        self.reclaimed_subs == 0 && self.reclaimed_pubs == 0 && self.drained_topics == 0
    }
}

pub fn sweep(layout: &ShmemLayout, drain_empty_topics: bool) -> GcReport {
    let mut report = GcReport::default();
    let Some(_global) = layout.global.try_lock_exclusive() else {
        report.skipped_busy += 1;
        return report;
    };

    match layout.subscribers.lock.try_lock_exclusive() {
        Some(_table) => {
            for (id, info) in layout.subscribers.slots.iter().enumerate() {
                if info.id().is_none() || info.owner().is_alive() {
                    continue;
                }
                let Some(guard) = info.lock.try_lock_exclusive() else {
                    report.skipped_busy += 1;
                    continue;
                };
                let owner = info.owner();
                release_subscriber(layout, id, &guard);
                report.reclaimed_subs += 1;
                log::warn!("gc: reclaimed subscriber {id} (dead pid {})", owner.pid);
            }
        }
        None => report.skipped_busy += 1,
    }

    match layout.publishers.lock.try_lock_exclusive() {
        Some(_table) => {
            for (id, info) in layout.publishers.slots.iter().enumerate() {
                if info.id().is_none() || info.owner().is_alive() {
                    continue;
                }
                let Some(guard) = info.lock.try_lock_exclusive() else {
                    report.skipped_busy += 1;
                    continue;
                };
                let owner = info.owner();
                release_publisher(layout, id, &guard);
                report.reclaimed_pubs += 1;
                log::warn!("gc: reclaimed publisher {id} (dead pid {})", owner.pid);
            }
        }
        None => report.skipped_busy += 1,
    }

    if drain_empty_topics {
        let topics = layout.topic_index();
        let empty: Vec<usize> = topics
            .live_slots()
            .filter(|&slot| topics.entity(slot).subscriber_count() == 0)
            .collect();
        for slot in empty {
            if topics.reclaim(slot) {
                report.drained_topics += 1;
            }
        }
    }

    if !report.is_noop() {
        log::debug!("gc pass: {report:?}");
    }
    report
}
