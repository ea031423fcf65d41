use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use race_core::worker::{mailbox, MailboxPolicy};
use race_core::{Bus, ChannelId, WorkerId};

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_fanout");
    for &subscribers in &[1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                b.iter_batched(
                    || {
                        let bus = Bus::new();
                        let channel: ChannelId = "/bench".into();
                        let mut receivers = Vec::with_capacity(subscribers);
                        for i in 0..subscribers {
                            let (tx, rx) = mailbox(MailboxPolicy::DropNewest { capacity: 1 });
                            bus.subscribe(WorkerId::new(format!("sub-{i}")), channel.clone(), tx);
                            receivers.push(rx);
                        }
                        (bus, channel, receivers)
                    },
                    |(bus, channel, receivers)| {
                        let delivered = bus.publish(&channel, black_box(7u32), None);
                        assert_eq!(delivered, receivers.len());
                        black_box(receivers);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fanout);
criterion_main!(benches);
