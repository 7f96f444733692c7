//! Client surface: connect, subscribe, publish, receive.
//!
//! ```no_run
//! use mss::{ChannelConfig, Mss, RoutingMode};
//!
//! let mss = Mss::open("/dev/shm/mss.region")?;
//!
//! let mut sub = mss.sub_connect(ChannelConfig::default())?;
//! sub.subscribe("tick", RoutingMode::Multicast)?;
//!
//! let mut publisher = mss.pub_connect(ChannelConfig::default())?;
//! publisher.publish_fast("tick", b"hello")?;
//!
//! if let Some(event) = sub.try_receive()? {
//!     assert_eq!(event.payload(), b"hello");
//! }
//! # Ok::<(), mss::Error>(())
//! ```
//!
//! Handles own their endpoint slot: dropping one disconnects it.

pub mod inspect;
mod publish;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bitmap;
use crate::channel::{self, ChannelConfig, ChannelHandle, RecvStatus, Role};
use crate::clock::{Clock, SystemClock};
use crate::constants::{ENVELOPE_HEADER_LEN, MAX_FRAME, MAX_PAYLOAD, MONITOR_TIMEOUT};
use crate::endpoint::{self, EndpointSlot, SubscriberInfo};
use crate::process::ProcessIdentity;
use crate::shmem::{Region, ShmemLayout};
use crate::topic::{validate_topic, RoutingMode};
use crate::{Error, Result};

pub use publish::Delivery;

const RECEIVE_PARK: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct MssConfig {
    /// Upper bound for one reliable publish.
    pub reliable_timeout: Duration,
    /// Longest single park of a reliable publish before it re-checks its targets.
    pub park_interval: Duration,
    /// Deadline of a blocking receive called without one.
    pub receive_timeout: Duration,
}

impl Default for MssConfig {
    fn default() -> Self {
        Self {
            reliable_timeout: MONITOR_TIMEOUT,
            park_interval: Duration::from_millis(50),
            receive_timeout: MONITOR_TIMEOUT,
        }
    }
}

/// A process's attachment to the shared region.
#[derive(Clone)]
pub struct Mss {
    region: Arc<Region>,
    config: MssConfig,
}

impl Mss {
    /// Creates and initialises the region, then attaches to it. Supervisor only.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_region(Arc::new(Region::create(path)?), MssConfig::default()))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, MssConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: MssConfig) -> Result<Self> {
        Ok(Self::from_region(Arc::new(Region::open(path)?), config))
    }

    pub fn from_region(region: Arc<Region>, config: MssConfig) -> Self {
        Self { region, config }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn config(&self) -> &MssConfig {
        &self.config
    }

    fn layout(&self) -> &ShmemLayout {
        self.region.layout()
    }

    pub fn sub_connect(&self, config: ChannelConfig) -> Result<Subscriber> {
        self.sub_connect_as(ProcessIdentity::current()?, config)
    }

    /// Registers a subscriber owned by `owner` instead of the calling process.
    ///
    /// The monitor reclaims the slot once `owner` exits.
    pub fn sub_connect_as(&self, owner: ProcessIdentity, config: ChannelConfig) -> Result<Subscriber> {
        let layout = self.layout();
        let _global = layout.global.lock_exclusive();
        let _table = layout.subscribers.lock.lock_exclusive();
        let mut handle = None;
        let claim = endpoint::acquire(
            &layout.subscribers.slots,
            owner,
            &layout.header.subs_count,
            |id, info| {
                let index = channel::subscriber_channel(id);
                let chan = ChannelHandle::init(
                    index,
                    &layout.channels[index],
                    &config,
                    Role::Subscriber,
                    owner,
                )?;
                bitmap::clear_all(&info.topics);
                info.channel.store(index as u32, Ordering::Relaxed);
                handle = Some(chan);
                Ok(())
            },
        )?;
        let channel = handle.ok_or(Error::ChannelInitFailed("channel handle missing"))?;
        let id = claim.index;
        log::debug!(
            "subscriber {id} connected (pid {}, {} channel)",
            owner.pid,
            channel.channel_type().name()
        );
        Ok(Subscriber {
            mss: self.clone(),
            id,
            generation: claim.generation,
            owner,
            channel,
            connected: true,
        })
    }

    pub fn pub_connect(&self, config: ChannelConfig) -> Result<Publisher> {
        self.pub_connect_as(ProcessIdentity::current()?, config)
    }

    pub fn pub_connect_as(&self, owner: ProcessIdentity, config: ChannelConfig) -> Result<Publisher> {
        self.pub_connect_with_clock(owner, config, SystemClock)
    }

    /// Registers a publisher that stamps events with `clock`.
    pub fn pub_connect_with_clock<C: Clock>(
        &self,
        owner: ProcessIdentity,
        config: ChannelConfig,
        clock: C,
    ) -> Result<Publisher<C>> {
        let layout = self.layout();
        let _global = layout.global.lock_exclusive();
        let _table = layout.publishers.lock.lock_exclusive();
        let mut handle = None;
        let claim = endpoint::acquire(
            &layout.publishers.slots,
            owner,
            &layout.header.pubs_count,
            |id, info| {
                let index = channel::publisher_channel(id);
                let chan = ChannelHandle::init(
                    index,
                    &layout.channels[index],
                    &config,
                    Role::Publisher,
                    owner,
                )?;
                info.channel.store(index as u32, Ordering::Relaxed);
                handle = Some(chan);
                Ok(())
            },
        )?;
        let channel = handle.ok_or(Error::ChannelInitFailed("channel handle missing"))?;
        let id = claim.index;
        log::debug!("publisher {id} connected (pid {})", owner.pid);
        Ok(Publisher {
            mss: self.clone(),
            id,
            generation: claim.generation,
            owner,
            channel,
            clock,
            connected: true,
        })
    }

    /// Resolves a topic key carried by an [`Event`] while the topic is live.
    pub fn topic_name(&self, topic_key: u32) -> Option<String> {
        let layout = self.layout();
        let _global = layout.global.lock_shared();
        layout.topic_index().name_of(topic_key as usize)
    }

    /// Resolves a topic name through the topic hash map.
    pub fn topic_key(&self, topic: &str) -> Option<u32> {
        let name = validate_topic(topic).ok()?;
        let layout = self.layout();
        let _global = layout.global.lock_shared();
        layout.topic_index().lookup(name).map(|slot| slot as u32)
    }

    pub fn subscriber_count(&self) -> u32 {
        self.layout().header.subs_count.load(Ordering::Acquire)
    }

    pub fn publisher_count(&self) -> u32 {
        self.layout().header.pubs_count.load(Ordering::Acquire)
    }
}

/// Removes subscriber `id` from every topic and frees its slot and channel.
/// Caller holds the global lock, the subscriber table lock, and the slot lock.
pub(crate) fn release_subscriber(
    layout: &ShmemLayout,
    id: usize,
    slot_guard: &crate::lock::ExclusiveGuard<'_>,
) {
    let info: &SubscriberInfo = &layout.subscribers.slots[id];
    let topics = layout.topic_index();
    let held = endpoint::clear_subscriptions(info);
    for slot in held.iter() {
        bitmap::clear(&topics.entity(slot).subscribers, id);
    }
    // Bits cleared by a publisher's self-healing are gone from the topic side
    // only; sweep every live topic so none keeps a stale bit for this id.
    for slot in topics.live_slots() {
        bitmap::clear(&topics.entity(slot).subscribers, id);
    }
    if let Some(index) = info.channel() {
        channel::close(&layout.channels[index]);
    }
    endpoint::release(info, &layout.header.subs_count, slot_guard);
    layout.header.consume.notify();
}

/// Frees publisher `id` and its channel. Same locking as [`release_subscriber`].
pub(crate) fn release_publisher(
    layout: &ShmemLayout,
    id: usize,
    slot_guard: &crate::lock::ExclusiveGuard<'_>,
) {
    let info = &layout.publishers.slots[id];
    if let Some(index) = info.channel() {
        channel::close(&layout.channels[index]);
    }
    endpoint::release(info, &layout.header.pubs_count, slot_guard);
}

/// One received event. The payload lives inline; no allocation per receive.
#[derive(Clone, Copy)]
pub struct Event {
    pub topic_key: u32,
    pub timestamp_us: u64,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl Event {
    fn decode(timestamp_us: u64, frame: &[u8]) -> Result<Self> {
        if frame.len() < ENVELOPE_HEADER_LEN || frame.len() > ENVELOPE_HEADER_LEN + MAX_PAYLOAD {
            return Err(Error::Corrupt("event envelope length"));
        }
        let mut key = [0u8; ENVELOPE_HEADER_LEN];
        key.copy_from_slice(&frame[..ENVELOPE_HEADER_LEN]);
        let payload = &frame[ENVELOPE_HEADER_LEN..];
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            topic_key: u32::from_le_bytes(key),
            timestamp_us,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("topic_key", &self.topic_key)
            .field("timestamp_us", &self.timestamp_us)
            .field("payload", &self.payload())
            .finish()
    }
}

/// A registered subscriber endpoint.
pub struct Subscriber {
    mss: Mss,
    id: usize,
    generation: u32,
    owner: ProcessIdentity,
    channel: ChannelHandle,
    connected: bool,
}

impl Subscriber {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn owner(&self) -> ProcessIdentity {
        self.owner
    }

    fn info<'a>(&self, layout: &'a ShmemLayout) -> Result<&'a SubscriberInfo> {
        let info = &layout.subscribers.slots[self.id];
        if !self.connected || !info.held_by(self.id, &self.owner, self.generation) {
            return Err(Error::NotRegistered);
        }
        Ok(info)
    }

    /// Subscribes to `topic`, creating it with `mode` if it does not exist.
    pub fn subscribe(&mut self, topic: &str, mode: RoutingMode) -> Result<()> {
        let name = validate_topic(topic)?;
        let layout = self.mss.layout();
        let _global = layout.global.lock_exclusive();
        let info = self.info(layout)?;
        let topics = layout.topic_index();
        let slot = topics.lookup_or_create(name, mode)?;
        let newly = bitmap::set(&topics.entity(slot).subscribers, self.id);
        {
            let _slot = info.lock.lock_exclusive();
            bitmap::set(&info.topics, slot);
        }
        if newly {
            log::debug!("subscriber {} subscribed to {topic} ({})", self.id, mode.name());
        }
        Ok(())
    }

    /// Drops the subscription to `topic`. Unknown topics are not an error.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let name = validate_topic(topic)?;
        let layout = self.mss.layout();
        let _global = layout.global.lock_exclusive();
        let info = self.info(layout)?;
        let topics = layout.topic_index();
        let Some(slot) = topics.lookup(name) else {
            return Ok(());
        };
        bitmap::clear(&topics.entity(slot).subscribers, self.id);
        let _slot = info.lock.lock_exclusive();
        bitmap::clear(&info.topics, slot);
        Ok(())
    }

    /// Topic keys this subscriber currently holds.
    pub fn subscriptions(&self) -> Result<Vec<u32>> {
        let layout = self.mss.layout();
        let info = self.info(layout)?;
        Ok(info.subscribed().iter().map(|slot| slot as u32).collect())
    }

    /// Takes one event if one is queued.
    pub fn try_receive(&mut self) -> Result<Option<Event>> {
        let layout = self.mss.layout();
        self.info(layout)?;
        let slot = &layout.channels[self.channel.index()];
        let mut buf = [0u8; MAX_FRAME];
        match self.channel.receive(slot, &mut buf)? {
            RecvStatus::Frame { timestamp_us, len } => {
                layout.header.consume.notify();
                Event::decode(timestamp_us, &buf[..len]).map(Some)
            }
            RecvStatus::Empty => Ok(None),
            RecvStatus::PeerGone => Err(Error::NotRegistered),
        }
    }

    /// Waits for one event for at most `timeout`, or
    /// [`MssConfig::receive_timeout`] when `None`.
    ///
    /// Returns `Error::Shutdown` as soon as the monitor starts draining and
    /// `Error::Timeout` when the deadline passes.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Event> {
        let deadline = Instant::now() + timeout.unwrap_or(self.mss.config.receive_timeout);
        let region = Arc::clone(&self.mss.region);
        let latch = &region.layout().channels[self.channel.index()].control.latch;
        loop {
            if region.shutting_down() {
                return Err(Error::Shutdown);
            }
            let token = latch.prepare();
            if region.shutting_down() {
                latch.cancel(token);
                return Err(Error::Shutdown);
            }
            match self.try_receive() {
                Ok(Some(event)) => {
                    latch.cancel(token);
                    return Ok(event);
                }
                Ok(None) => {}
                Err(err) => {
                    latch.cancel(token);
                    return Err(err);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                latch.cancel(token);
                return Err(Error::Timeout);
            }
            latch.park(token, (deadline - now).min(RECEIVE_PARK))?;
        }
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.disconnect_inner()
    }

    fn disconnect_inner(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let layout = self.mss.layout();
        let _global = layout.global.lock_exclusive();
        let _table = layout.subscribers.lock.lock_exclusive();
        let info = &layout.subscribers.slots[self.id];
        let slot_guard = info.lock.lock_exclusive();
        if !info.held_by(self.id, &self.owner, self.generation) {
            return Err(Error::NotRegistered);
        }
        release_subscriber(layout, self.id, &slot_guard);
        log::debug!("subscriber {} disconnected", self.id);
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect_inner() {
            log::debug!("subscriber {} drop: {err}", self.id);
        }
    }
}

/// A registered publisher endpoint.
pub struct Publisher<C: Clock = SystemClock> {
    mss: Mss,
    id: usize,
    generation: u32,
    owner: ProcessIdentity,
    channel: ChannelHandle,
    clock: C,
    connected: bool,
}

impl<C: Clock> Publisher<C> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn owner(&self) -> ProcessIdentity {
        self.owner
    }

    fn check_registered(&self) -> Result<()> {
        let info = &self.mss.layout().publishers.slots[self.id];
        if !self.connected || !info.held_by(self.id, &self.owner, self.generation) {
            return Err(Error::NotRegistered);
        }
        Ok(())
    }

    /// Delivers without waiting: full channels drop the event.
    pub fn publish_fast(&mut self, topic: &str, payload: &[u8]) -> Result<Delivery> {
        self.publish(topic, payload, false)
    }

    /// Retries declining subscribers until they accept, vanish, or the
    /// configured timeout passes.
    pub fn publish_reliable(&mut self, topic: &str, payload: &[u8]) -> Result<Delivery> {
        self.publish(topic, payload, true)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], reliable: bool) -> Result<Delivery> {
        let name = validate_topic(topic)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArg("payload exceeds MAX_PAYLOAD"));
        }
        self.check_registered()?;
        let timestamp_us = self.clock.now_us();
        let mut router = publish::Router::new(&self.mss, name, payload, timestamp_us)?;
        let result = if reliable {
            router.reliable()
        } else {
            router.fast()
        };
        if let Ok(delivery) = &result {
            let own = &self.mss.layout().channels[self.channel.index()].control;
            own.sent
                .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
            own.dropped
                .fetch_add(delivery.dropped as u64, Ordering::Relaxed);
        }
        result
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.disconnect_inner()
    }

    fn disconnect_inner(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let layout = self.mss.layout();
        let _global = layout.global.lock_exclusive();
        let _table = layout.publishers.lock.lock_exclusive();
        let info = &layout.publishers.slots[self.id];
        let slot_guard = info.lock.lock_exclusive();
        if !info.held_by(self.id, &self.owner, self.generation) {
            return Err(Error::NotRegistered);
        }
        release_publisher(layout, self.id, &slot_guard);
        log::debug!("publisher {} disconnected", self.id);
        Ok(())
    }
}

impl<C: Clock> Drop for Publisher<C> {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect_inner() {
            log::debug!("publisher {} drop: {err}", self.id);
        }
    }
}
