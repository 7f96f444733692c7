use std::collections::HashSet;
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mss::{
    ChannelConfig, Error, Monitor, MonitorConfig, MonitorState, Mss, ProcessIdentity,
    RoutingMode, ShutdownMode,
};
use tempfile::tempdir;

fn spawn_owner() -> (Child, ProcessIdentity) {
    let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let identity = ProcessIdentity::of(child.id()).expect("child identity");
    (child, identity)
}

fn kill(mut child: Child) {
    child.kill().expect("kill child");
    child.wait().expect("reap child");
}

#[test]
fn single_subscriber_multicast() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");

    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    sub.subscribe("tick", RoutingMode::Multicast).expect("subscribe");
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");

    let delivery = publisher.publish_fast("tick", b"hello").expect("publish");
    assert_eq!(delivery.delivered, 1);

    let event = sub
        .receive(Some(Duration::from_secs(1)))
        .expect("receive");
    assert_eq!(event.payload(), b"hello");
    assert_eq!(event.len(), 5);
    assert_eq!(mss.topic_name(event.topic_key).as_deref(), Some("tick"));
    assert!(event.timestamp_us > 0);
}

#[test]
fn anycast_round_robin_spreads_one_event_each() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");

    let mut subs: Vec<_> = (0..3)
        .map(|_| {
            let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
            sub.subscribe("work", RoutingMode::Anycast).expect("subscribe");
            sub
        })
        .collect();
    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");
    for payload in [b"A", b"B", b"C"] {
        let delivery = publisher.publish_fast("work", payload).expect("publish");
        assert_eq!(delivery.delivered, 1);
    }

    let mut seen = HashSet::new();
    for sub in subs.iter_mut() {
        let event = sub.try_receive().expect("try_receive").expect("one event");
        assert!(seen.insert(event.payload().to_vec()));
        assert!(sub.try_receive().expect("try_receive").is_none());
    }
    let expected: HashSet<Vec<u8>> = [b"A", b"B", b"C"].iter().map(|p| p.to_vec()).collect();
    assert_eq!(seen, expected);
}

#[test]
fn routing_mismatch_leaves_first_subscriber_in_place() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");

    let mut first = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    first.subscribe("evt", RoutingMode::Multicast).expect("subscribe");
    let mut second = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");

    let err = second
        .subscribe("evt", RoutingMode::Anycast)
        .expect_err("mismatch");
    assert!(matches!(err, Error::RoutingMismatch));
    assert_eq!(err.code().as_str(), "routing-mismatch");

    let snapshot = mss.snapshot();
    let topic = snapshot.topics.iter().find(|t| t.name == "evt").expect("topic");
    assert_eq!(topic.subscribers, vec![first.id()]);
    assert_eq!(topic.mode, "multicast");
    assert!(second.subscriptions().expect("subscriptions").is_empty());
}

#[test]
fn dead_peer_is_skipped_then_collected() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");
    let (child, owner) = spawn_owner();

    let mut s1 = mss
        .sub_connect_as(owner, ChannelConfig::mailbox())
        .expect("sub_connect_as");
    let mut s2 = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    s1.subscribe("m", RoutingMode::Multicast).expect("subscribe s1");
    s2.subscribe("m", RoutingMode::Multicast).expect("subscribe s2");

    let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub_connect");
    // Fill s1's mailbox so the next send has to check its owner.
    publisher.publish_fast("m", b"w").expect("warm-up publish");
    assert_eq!(s2.try_receive().expect("drain s2").map(|e| e.len()), Some(1));
    kill(child);

    let delivery = publisher.publish_reliable("m", b"x").expect("reliable publish");
    assert_eq!(delivery.delivered, 1);
    assert_eq!(delivery.peers_gone, 1);
    let event = s2.try_receive().expect("try_receive").expect("event");
    assert_eq!(event.payload(), b"x");

    let mut monitor = Monitor::new(Arc::clone(mss.region()), MonitorConfig::default());
    let report = monitor.collect_garbage();
    assert_eq!(report.reclaimed_subs, 1);

    let snapshot = mss.snapshot();
    let topic = snapshot.topics.iter().find(|t| t.name == "m").expect("topic");
    assert_eq!(topic.subscribers, vec![s2.id()]);
    assert!(snapshot.subscribers.iter().all(|s| s.id != s1.id()));
    assert!(matches!(s1.subscribe("m", RoutingMode::Multicast), Err(Error::NotRegistered)));
}

#[test]
fn full_subscriber_table_is_capacity_exceeded_without_changes() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");

    let subs: Vec<_> = (0..mss::constants::MAX_SUBS)
        .map(|_| mss.sub_connect(ChannelConfig::default()).expect("sub_connect"))
        .collect();
    let before = serde_json::to_value(mss.snapshot()).expect("snapshot json");

    let err = mss
        .sub_connect(ChannelConfig::default())
        .err()
        .expect("table full");
    assert!(matches!(err, Error::CapacityExceeded(_)));
    assert_eq!(err.code().as_str(), "capacity-exceeded");

    let after = serde_json::to_value(mss.snapshot()).expect("snapshot json");
    assert_eq!(before, after);
    assert_eq!(mss.subscriber_count() as usize, subs.len());
}

#[test]
fn blocked_receive_returns_shutdown_when_monitor_drains() {
    let dir = tempdir().expect("tempdir");
    let mss = Mss::create(dir.path().join("mss.region")).expect("create region");
    let monitor = Monitor::new(Arc::clone(mss.region()), MonitorConfig::default());
    let handle = monitor.handle();
    let monitor_thread = thread::spawn(move || monitor.run());

    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub_connect");
    sub.subscribe("quiet", RoutingMode::Multicast).expect("subscribe");
    let receiver = thread::spawn(move || {
        let started = Instant::now();
        let result = sub.receive(None);
        (result, started.elapsed())
    });

    let region = Arc::clone(mss.region());
    while region.monitor_state() != MonitorState::Running {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    handle.request_shutdown(ShutdownMode::Smart);

    let (result, waited) = receiver.join().expect("receiver thread");
    assert!(matches!(result, Err(Error::Shutdown)));
    assert!(waited < mss::constants::MONITOR_TIMEOUT);

    let report = monitor_thread.join().expect("monitor thread").expect("monitor run");
    assert_eq!(report.shutdown, Some(ShutdownMode::Smart));
    assert_eq!(region.monitor_state(), MonitorState::Stopped);
}
