//! Routing of one published event to the subscribers of its topic.
//!
//! Every delivery attempt runs under the global lock held shared, so the
//! topic and subscriber tables cannot change shape underneath it. A
//! subscriber's channel is written while holding that subscriber's slot lock
//! exclusive: the slot lock is what keeps each channel single-producer.
//!
//! Subscribers found dead during routing are healed out of the topic bitmap
//! with an atomic clear; their slots are left for the monitor to reclaim.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::bitmap::{self, Snapshot};
use crate::channel::{self, SendStatus};
use crate::constants::{ENVELOPE_HEADER_LEN, MAX_ENVELOPE, SUB_WORDS};
use crate::endpoint::EndpointSlot;
use crate::monitor::MonitorState;
use crate::shmem::{Region, ShmemLayout};
use crate::topic::{RoutingMode, TopicEntity};
use crate::{Error, Result};

use super::Mss;

/// Outcome of one publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers whose channel accepted the event.
    pub delivered: u32,
    /// Subscribers whose channel was full (fast publish only).
    pub dropped: u32,
    /// Subscribers found dead and removed from the topic.
    pub peers_gone: u32,
}

impl Delivery {
    fn settle(self) -> Result<Self> {
        if self.delivered == 0 && self.dropped == 0 && self.peers_gone > 0 {
            return Err(Error::PeerGone);
        }
        Ok(self)
    }
}

/// Counts a publish in `header.inflight` for the monitor's drain.
struct InflightGuard<'a> {
    region: &'a Region,
}

impl<'a> InflightGuard<'a> {
    fn enter(region: &'a Region) -> Result<Self> {
        if region.shutting_down() {
            return Err(Error::Shutdown);
        }
        region.header().inflight.fetch_add(1, Ordering::AcqRel);
        let guard = Self { region };
        // Re-check: the monitor may have started draining between the load
        // and the increment.
        if region.shutting_down() {
            return Err(Error::Shutdown);
        }
        Ok(guard)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let header = self.region.header();
        if header.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            header.monitor_latch.notify();
        }
    }
}

enum Round {
    Done(Delivery),
    Retry,
}

pub(super) struct Router<'a> {
    mss: &'a Mss,
    name: &'a [u8],
    envelope: [u8; MAX_ENVELOPE],
    len: usize,
    timestamp_us: u64,
}

impl<'a> Router<'a> {
    pub(super) fn new(mss: &'a Mss, name: &'a [u8], payload: &[u8], timestamp_us: u64) -> Result<Self> {
        if ENVELOPE_HEADER_LEN + payload.len() > MAX_ENVELOPE {
            return Err(Error::InvalidArg("payload exceeds MAX_PAYLOAD"));
        }
        let mut envelope = [0u8; MAX_ENVELOPE];
        envelope[ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + payload.len()].copy_from_slice(payload);
        Ok(Self {
            mss,
            name,
            envelope,
            len: ENVELOPE_HEADER_LEN + payload.len(),
            timestamp_us,
        })
    }

    fn layout(&self) -> &'a ShmemLayout {
        self.mss.region.layout()
    }

    fn set_key(&mut self, topic_slot: usize) {
        self.envelope[..ENVELOPE_HEADER_LEN].copy_from_slice(&(topic_slot as u32).to_le_bytes());
    }

    /// Hands the event to one subscriber's channel.
    ///
    /// With `check_owner` the subscriber's process is checked first, so a
    /// reliable publish never counts a frame parked in a dead subscriber's
    /// ring as delivered.
    fn offer(
        &self,
        topic_slot: usize,
        entity: &TopicEntity,
        sub: usize,
        check_owner: bool,
    ) -> Result<SendStatus> {
        let layout = self.layout();
        let info = &layout.subscribers.slots[sub];
        let status = {
            let _slot = info.lock.lock_exclusive();
            match info.channel() {
                Some(_) if check_owner && !info.owner().is_alive() => SendStatus::PeerGone,
                Some(index) if info.id() == Some(sub) && bitmap::test(&info.topics, topic_slot) => {
                    channel::send(
                        &layout.channels[index],
                        self.timestamp_us,
                        &self.envelope[..self.len],
                    )?
                }
                _ => SendStatus::PeerGone,
            }
        };
        if status == SendStatus::PeerGone && bitmap::clear(&entity.subscribers, sub) {
            log::warn!("healed dead subscriber {sub} out of topic slot {topic_slot}");
        }
        Ok(status)
    }

    pub(super) fn fast(&mut self) -> Result<Delivery> {
        let mss = self.mss;
        let layout = self.layout();
        let _inflight = InflightGuard::enter(&mss.region)?;
        let _global = layout.global.lock_shared();
        let topics = layout.topic_index();
        let slot = topics.lookup(self.name).ok_or(Error::NoSubscribers)?;
        let entity = topics.entity(slot);
        let mut targets = entity.snapshot();
        if targets.is_empty() {
            return Err(Error::NoSubscribers);
        }
        self.set_key(slot);
        let mut delivery = Delivery::default();
        match entity.routing_mode().ok_or(Error::Corrupt("topic routing mode"))? {
            RoutingMode::Anycast => {
                let cursor = entity.advance_cursor();
                while !targets.is_empty() {
                    let sub = pick(&targets, cursor);
                    match self.offer(slot, entity, sub, false)? {
                        SendStatus::Sent => {
                            delivery.delivered = 1;
                            break;
                        }
                        SendStatus::WouldBlock => {
                            delivery.dropped = 1;
                            break;
                        }
                        SendStatus::PeerGone => {
                            targets.remove(sub);
                            delivery.peers_gone += 1;
                        }
                    }
                }
            }
            RoutingMode::Multicast => {
                for sub in targets.iter() {
                    match self.offer(slot, entity, sub, false)? {
                        SendStatus::Sent => delivery.delivered += 1,
                        SendStatus::WouldBlock => delivery.dropped += 1,
                        SendStatus::PeerGone => delivery.peers_gone += 1,
                    }
                }
            }
        }
        delivery.settle()
    }

    pub(super) fn reliable(&mut self) -> Result<Delivery> {
        let mss = self.mss;
        let region = &mss.region;
        let config = mss.config;
        let _inflight = InflightGuard::enter(region)?;
        let consume = &self.layout().header.consume;
        let deadline = Instant::now() + config.reliable_timeout;
        let mut delivery = Delivery::default();
        let mut pending: Option<Snapshot<SUB_WORDS>> = None;

        loop {
            // Draining still lets an admitted publish finish; only a stopped
            // monitor ends it.
            if region.monitor_state() == MonitorState::Stopped {
                return Err(Error::Shutdown);
            }
            // Armed before the attempt so a consume racing with it still
            // wakes the park below.
            let token = consume.prepare();
            let round = self.reliable_round(&mut delivery, &mut pending);
            match round {
                Ok(Round::Done(done)) => {
                    consume.cancel(token);
                    return done.settle();
                }
                Ok(Round::Retry) => {}
                Err(err) => {
                    consume.cancel(token);
                    return Err(err);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                consume.cancel(token);
                log::debug!(
                    "reliable publish to {} timed out ({} delivered)",
                    String::from_utf8_lossy(self.name),
                    delivery.delivered
                );
                return Err(Error::Timeout);
            }
            let park: Duration = config.park_interval.min(deadline - now);
            consume.park(token, park)?;
        }
    }

    fn reliable_round(
        &mut self,
        delivery: &mut Delivery,
        pending: &mut Option<Snapshot<SUB_WORDS>>,
    ) -> Result<Round> {
        let layout = self.layout();
        let _global = layout.global.lock_shared();
        let topics = layout.topic_index();
        let Some(slot) = topics.lookup(self.name) else {
            return self.vanished(*delivery);
        };
        let entity = topics.entity(slot);
        let current = entity.snapshot();
        self.set_key(slot);

        match entity.routing_mode().ok_or(Error::Corrupt("topic routing mode"))? {
            RoutingMode::Anycast => {
                let mut targets = current;
                let attempts = targets.count();
                for _ in 0..attempts {
                    if targets.is_empty() {
                        break;
                    }
                    let sub = pick(&targets, entity.advance_cursor());
                    match self.offer(slot, entity, sub, true)? {
                        SendStatus::Sent => {
                            delivery.delivered = 1;
                            return Ok(Round::Done(*delivery));
                        }
                        SendStatus::WouldBlock => targets.remove(sub),
                        SendStatus::PeerGone => {
                            targets.remove(sub);
                            delivery.peers_gone += 1;
                        }
                    }
                }
                if entity.snapshot().is_empty() {
                    return self.vanished(*delivery);
                }
                Ok(Round::Retry)
            }
            RoutingMode::Multicast => {
                let targets = pending.get_or_insert(current);
                let round = *targets;
                for sub in round.iter() {
                    if !current.contains(sub) {
                        targets.remove(sub);
                        continue;
                    }
                    match self.offer(slot, entity, sub, true)? {
                        SendStatus::Sent => {
                            delivery.delivered += 1;
                            targets.remove(sub);
                        }
                        SendStatus::WouldBlock => {}
                        SendStatus::PeerGone => {
                            delivery.peers_gone += 1;
                            targets.remove(sub);
                        }
                    }
                }
                if !targets.is_empty() {
                    return Ok(Round::Retry);
                }
                if delivery.delivered == 0 && delivery.peers_gone == 0 {
                    return Err(Error::NoSubscribers);
                }
                Ok(Round::Done(*delivery))
            }
        }
    }

    fn vanished(&self, delivery: Delivery) -> Result<Round> {
        if delivery.peers_gone > 0 {
            return Err(Error::PeerGone);
        }
        Err(Error::NoSubscribers)
    }
}

fn pick(targets: &Snapshot<SUB_WORDS>, cursor: u32) -> usize {
    let n = targets.count();
    // `targets` is non-empty, so `nth` always finds a bit.
    targets.nth(cursor % n).unwrap_or(0)
}
