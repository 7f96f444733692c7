//! Read-only views of the region for tooling and invariant checks.
//!
//! A snapshot is taken under the global lock held shared, so topic and
//! endpoint structure is consistent; channel counters are read racily.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::channel::ChannelSlot;
use crate::endpoint::EndpointSlot;
use crate::monitor::MonitorState;
use crate::process::ProcessIdentity;
use crate::shmem::ShmemLayout;

use super::Mss;

#[derive(Clone, Debug, Serialize)]
pub struct RegionSnapshot {
    pub monitor_state: MonitorState,
    pub monitor_pid: u32,
    pub subs_count: u32,
    pub pubs_count: u32,
    pub inflight: u32,
    /// Names in the topic hash map; equals `topics.len()` when consistent.
    pub mapped_topics: usize,
    pub subscribers: Vec<SubscriberView>,
    pub publishers: Vec<PublisherView>,
    pub topics: Vec<TopicView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChannelView {
    pub index: usize,
    pub channel_type: &'static str,
    pub open: bool,
    pub backlog: u64,
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SubscriberView {
    pub id: usize,
    pub owner: ProcessIdentity,
    pub topics: Vec<usize>,
    pub channel: Option<ChannelView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublisherView {
    pub id: usize,
    pub owner: ProcessIdentity,
    pub channel: Option<ChannelView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TopicView {
    pub key: usize,
    pub name: String,
    pub mode: &'static str,
    pub subscribers: Vec<usize>,
}

fn channel_view(layout: &ShmemLayout, index: Option<usize>) -> Option<ChannelView> {
    let index = index?;
    let slot: &ChannelSlot = layout.channels.get(index)?;
    let c = &slot.control;
    Some(ChannelView {
        index,
        channel_type: slot.channel_type().map_or("unknown", |ty| ty.name()),
        open: slot.is_open(),
        backlog: slot.backlog(),
        sent: c.sent.load(Ordering::Relaxed),
        dropped: c.dropped.load(Ordering::Relaxed),
        received: c.received.load(Ordering::Relaxed),
    })
}

impl Mss {
    pub fn snapshot(&self) -> RegionSnapshot {
        let layout = self.layout();
        let _global = layout.global.lock_shared();
        let header = &layout.header;
        let topics = layout.topic_index();

        let subscribers = layout
            .subscribers
            .slots
            .iter()
            .filter_map(|info| {
                let id = info.id()?;
                Some(SubscriberView {
                    id,
                    owner: info.owner(),
                    topics: info.subscribed().iter().collect(),
                    channel: channel_view(layout, info.channel()),
                })
            })
            .collect();

        let publishers = layout
            .publishers
            .slots
            .iter()
            .filter_map(|info| {
                let id = info.id()?;
                Some(PublisherView {
                    id,
                    owner: info.owner(),
                    channel: channel_view(layout, info.channel()),
                })
            })
            .collect();

        let mapped_topics = topics.mapped_count();
        let topics = topics
            .live_slots()
            .map(|key| {
                let entity = topics.entity(key);
                TopicView {
                    key,
                    name: topics.name_of(key).unwrap_or_default(),
                    mode: entity.routing_mode().map_or("unknown", |m| m.name()),
                    subscribers: entity.snapshot().iter().collect(),
                }
            })
            .collect();

        RegionSnapshot {
            monitor_state: self.region.monitor_state(),
            monitor_pid: header.monitor_pid.load(Ordering::Acquire),
            subs_count: header.subs_count.load(Ordering::Acquire),
            pubs_count: header.pubs_count.load(Ordering::Acquire),
            inflight: header.inflight.load(Ordering::Acquire),
            mapped_topics,
            subscribers,
            publishers,
            topics,
        }
    }
}
