use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use mss::{ChannelConfig, Mss, RoutingMode};

const EVENTS_PER_ITER: usize = 32;

fn bench_publish_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fast");
    group.throughput(Throughput::Elements(EVENTS_PER_ITER as u64));
    for &size in &[8_usize, 32, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = tempdir().expect("tempdir");
            let mss = Mss::create(dir.path().join("bench.region")).expect("region");
            let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub");
            sub.subscribe("bench", RoutingMode::Multicast).expect("subscribe");
            let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub");
            let payload = vec![0u8; size];
            b.iter(|| {
                for _ in 0..EVENTS_PER_ITER {
                    publisher
                        .publish_fast("bench", black_box(&payload))
                        .expect("publish");
                }
                while let Some(event) = sub.try_receive().expect("receive") {
                    black_box(event.payload());
                }
            });
        });
    }
    group.finish();
}

fn bench_multicast_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("multicast_fanout");
    for &subs in &[1_usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(subs), &subs, |b, &subs| {
            let dir = tempdir().expect("tempdir");
            let mss = Mss::create(dir.path().join("bench.region")).expect("region");
            let mut receivers: Vec<_> = (0..subs)
                .map(|_| {
                    let mut sub = mss.sub_connect(ChannelConfig::default()).expect("sub");
                    sub.subscribe("fan", RoutingMode::Multicast).expect("subscribe");
                    sub
                })
                .collect();
            let mut publisher = mss.pub_connect(ChannelConfig::default()).expect("pub");
            b.iter(|| {
                let delivery = publisher.publish_fast("fan", black_box(b"tick")).expect("publish");
                black_box(delivery);
                for sub in receivers.iter_mut() {
                    sub.try_receive().expect("receive");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_publish_receive, bench_multicast_fanout);
criterion_main!(benches);
