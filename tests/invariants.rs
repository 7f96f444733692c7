use std::collections::{HashMap, HashSet};
use std::process::Command;

use mss::api::inspect::RegionSnapshot;
use mss::constants::{MAX_PAYLOAD, MAX_TOPICS, MAX_TOPIC_LEN};
use mss::{ChannelConfig, Error, Mss, ProcessIdentity, RoutingMode};
use tempfile::tempdir;

fn open_region() -> (tempfile::TempDir, Mss) {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");
    (dir, mss)
}

/// Both sides of every subscription agree, every live topic slot is reachable
/// by name through the hash map, and no two endpoints share a channel.
fn check_invariants(mss: &Mss, snapshot: &RegionSnapshot) {
    assert_eq!(snapshot.mapped_topics, snapshot.topics.len(), "map and used bitmap disagree");
    for topic in &snapshot.topics {
        assert_eq!(
            mss.topic_key(&topic.name),
            Some(topic.key as u32),
            "topic {} not reachable through the map",
            topic.name
        );
        assert_eq!(mss.topic_name(topic.key as u32).as_deref(), Some(topic.name.as_str()));
    }

    let mut by_topic: HashMap<usize, HashSet<usize>> = HashMap::new();
    for sub in &snapshot.subscribers {
        for &topic in &sub.topics {
            by_topic.entry(topic).or_default().insert(sub.id);
        }
    }
    for topic in &snapshot.topics {
        let from_topic: HashSet<usize> = topic.subscribers.iter().copied().collect();
        let from_subs = by_topic.remove(&topic.key).unwrap_or_default();
        assert_eq!(from_topic, from_subs, "topic {} bitmaps disagree", topic.name);
    }
    assert!(by_topic.is_empty(), "subscriber holds a dead topic: {by_topic:?}");

    let mut channels = HashSet::new();
    let endpoint_channels = snapshot
        .subscribers
        .iter()
        .map(|s| &s.channel)
        .chain(snapshot.publishers.iter().map(|p| &p.channel));
    for channel in endpoint_channels {
        let channel = channel.as_ref().expect("live endpoint has a channel");
        assert!(channels.insert(channel.index), "channel {} shared", channel.index);
    }
    assert_eq!(snapshot.subs_count as usize, snapshot.subscribers.len());
    assert_eq!(snapshot.pubs_count as usize, snapshot.publishers.len());
}

#[test]
fn bitmaps_stay_in_sync_through_membership_changes() {
    let (_dir, mss) = open_region();
    let mut a = mss.sub_connect(ChannelConfig::default()).expect("connect a");
    let mut b = mss.sub_connect(ChannelConfig::mailbox()).expect("connect b");
    let _publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");

    a.subscribe("x", RoutingMode::Multicast).expect("a x");
    a.subscribe("y", RoutingMode::Anycast).expect("a y");
    b.subscribe("x", RoutingMode::Multicast).expect("b x");
    check_invariants(&mss, &mss.snapshot());

    a.unsubscribe("x").expect("a unsub x");
    a.unsubscribe("never-created").expect("absent topic is ok");
    check_invariants(&mss, &mss.snapshot());

    let b_id = b.id();
    b.disconnect().expect("disconnect b");
    let snapshot = mss.snapshot();
    check_invariants(&mss, &snapshot);
    assert!(snapshot.topics.iter().all(|t| !t.subscribers.contains(&b_id)));
}

#[test]
fn subscribe_twice_is_idempotent() {
    let (_dir, mss) = open_region();
    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    sub.subscribe("dup", RoutingMode::Multicast).expect("first");
    let before = serde_json::to_value(mss.snapshot()).expect("json");
    sub.subscribe("dup", RoutingMode::Multicast).expect("second");
    assert_eq!(before, serde_json::to_value(mss.snapshot()).expect("json"));
    assert_eq!(sub.subscriptions().expect("subscriptions").len(), 1);
}

#[test]
fn full_topic_index_rejects_new_topic_and_keeps_state() {
    let (_dir, mss) = open_region();
    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    for i in 0..MAX_TOPICS {
        sub.subscribe(&format!("t{i}"), RoutingMode::Multicast)
            .expect("subscribe");
    }
    let err = sub
        .subscribe("one-too-many", RoutingMode::Multicast)
        .expect_err("index full");
    assert!(matches!(err, Error::CapacityExceeded(_)));

    let snapshot = mss.snapshot();
    assert_eq!(snapshot.topics.len(), MAX_TOPICS);
    assert!(snapshot.topics.iter().all(|t| t.name != "one-too-many"));
    assert_eq!(sub.subscriptions().expect("subscriptions").len(), MAX_TOPICS);
    check_invariants(&mss, &snapshot);
}

#[test]
fn empty_topic_has_no_subscribers_in_both_modes() {
    let (_dir, mss) = open_region();
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");
    assert!(matches!(
        publisher.publish_fast("nobody", b"x"),
        Err(Error::NoSubscribers)
    ));

    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    sub.subscribe("gone", RoutingMode::Anycast).expect("subscribe");
    sub.unsubscribe("gone").expect("unsubscribe");
    assert!(matches!(
        publisher.publish_fast("gone", b"x"),
        Err(Error::NoSubscribers)
    ));
    assert!(matches!(
        publisher.publish_reliable("gone", b"x"),
        Err(Error::NoSubscribers)
    ));
}

#[test]
fn dead_subscriber_mid_publish_is_healed_and_others_delivered() {
    let (_dir, mss) = open_region();
    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let owner = ProcessIdentity::of(child.id()).expect("child identity");

    let mut dead = mss
        .sub_connect_as(owner, ChannelConfig::mailbox())
        .expect("sub_connect_as");
    let mut live = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    dead.subscribe("feed", RoutingMode::Multicast).expect("subscribe dead");
    live.subscribe("feed", RoutingMode::Multicast).expect("subscribe live");

    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");
    let first = publisher.publish_fast("feed", b"1").expect("first publish");
    assert_eq!(first.delivered, 2);

    child.kill().expect("kill");
    child.wait().expect("reap");

    let second = publisher.publish_fast("feed", b"2").expect("second publish");
    assert_eq!(second.delivered, 1);
    assert_eq!(second.peers_gone, 1);

    let snapshot = mss.snapshot();
    let topic = snapshot.topics.iter().find(|t| t.name == "feed").expect("topic");
    assert_eq!(topic.subscribers, vec![live.id()]);

    let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| live.try_receive().expect("receive"))
        .map(|e| e.payload().to_vec())
        .collect();
    assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
}

#[test]
fn reliable_anycast_skips_a_dead_subscriber_with_room_in_its_ring() {
    let (_dir, mss) = open_region();
    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let owner = ProcessIdentity::of(child.id()).expect("child identity");

    let mut dead = mss
        .sub_connect_as(owner, ChannelConfig::default())
        .expect("sub_connect_as");
    let mut live = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    dead.subscribe("work", RoutingMode::Anycast).expect("subscribe dead");
    live.subscribe("work", RoutingMode::Anycast).expect("subscribe live");
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");

    child.kill().expect("kill");
    child.wait().expect("reap");

    // Round-robin lands on the dead subscriber in one of the two publishes.
    let mut peers_gone = 0;
    for payload in [b"one", b"two"] {
        let delivery = publisher
            .publish_reliable("work", payload)
            .expect("reliable publish");
        assert_eq!(delivery.delivered, 1);
        peers_gone += delivery.peers_gone;
    }
    assert_eq!(peers_gone, 1);

    let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| live.try_receive().expect("receive"))
        .map(|e| e.payload().to_vec())
        .collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);

    let snapshot = mss.snapshot();
    let topic = snapshot.topics.iter().find(|t| t.name == "work").expect("topic");
    assert_eq!(topic.subscribers, vec![live.id()]);
    let dead_view = snapshot
        .subscribers
        .iter()
        .find(|s| s.id == dead.id())
        .expect("dead slot awaits gc");
    assert_eq!(dead_view.channel.as_ref().expect("channel").backlog, 0);
}

#[test]
fn only_dead_targets_is_peer_gone() {
    let (_dir, mss) = open_region();
    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let owner = ProcessIdentity::of(child.id()).expect("child identity");
    let mut dead = mss
        .sub_connect_as(owner, ChannelConfig::mailbox())
        .expect("sub_connect_as");
    dead.subscribe("solo", RoutingMode::Anycast).expect("subscribe");

    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");
    publisher.publish_fast("solo", b"fill").expect("fill mailbox");
    child.kill().expect("kill");
    child.wait().expect("reap");

    assert!(matches!(
        publisher.publish_fast("solo", b"x"),
        Err(Error::PeerGone)
    ));
    // Healed: the topic is now empty.
    assert!(matches!(
        publisher.publish_fast("solo", b"x"),
        Err(Error::NoSubscribers)
    ));
}

#[test]
fn frames_arrive_byte_identical_and_in_order() {
    let (_dir, mss) = open_region();
    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    sub.subscribe("seq", RoutingMode::Multicast).expect("subscribe");
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");

    // Enough frames to wrap the ring at least once.
    let mut expected = Vec::new();
    for round in 0..8u8 {
        for i in 0..30u8 {
            let payload: Vec<u8> = (0..(i % 50)).map(|b| b ^ round).collect();
            publisher.publish_fast("seq", &payload).expect("publish");
            expected.push(payload);
        }
        while let Some(event) = sub.try_receive().expect("receive") {
            assert_eq!(event.payload(), expected.remove(0).as_slice());
        }
    }
    assert!(expected.is_empty());
}

#[test]
fn argument_validation() {
    let (_dir, mss) = open_region();
    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");

    assert!(matches!(
        sub.subscribe("", RoutingMode::Multicast),
        Err(Error::InvalidArg(_))
    ));
    let long = "x".repeat(MAX_TOPIC_LEN);
    assert!(matches!(
        sub.subscribe(&long, RoutingMode::Multicast),
        Err(Error::InvalidArg(_))
    ));
    sub.subscribe(&"x".repeat(MAX_TOPIC_LEN - 1), RoutingMode::Multicast)
        .expect("longest valid topic");

    let big = vec![0u8; MAX_PAYLOAD + 1];
    assert!(matches!(
        publisher.publish_fast("x", &big),
        Err(Error::InvalidArg(_))
    ));
    let max = vec![7u8; MAX_PAYLOAD];
    publisher
        .publish_fast(&"x".repeat(MAX_TOPIC_LEN - 1), &max)
        .expect("max payload");
    let event = sub.try_receive().expect("receive").expect("event");
    assert_eq!(event.payload(), max.as_slice());
}
