//! 📏 Hot-path benchmarks: framing records into stream messages, and popping batches
//! off the queue while references wait for their objects.

use std::collections::{BTreeMap, HashSet};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::{Map, Value};
use uuid::Uuid;
use vbx::queue::RecordQueue;
use vbx::records::{PendingObject, PendingReference, Record, Vectors};
use vbx::transport::framing::frame_records;

fn object(index: u64, dims: usize) -> Record {
    let mut properties = Map::new();
    properties.insert("title".into(), Value::from(format!("article number {index}")));
    properties.insert("views".into(), Value::from(index * 7));
    Record::Object(PendingObject {
        index,
        collection: "Article".into(),
        uuid: Uuid::new_v4(),
        properties,
        references: BTreeMap::new(),
        vectors: Some(Vectors::Single(vec![0.25; dims])),
        tenant: None,
        retries: 0,
    })
}

fn reference(index: u64, from_uuid: Uuid) -> Record {
    Record::Reference(PendingReference {
        index,
        from_collection: "Article".into(),
        from_uuid,
        from_property: "cites".into(),
        to_collection: None,
        to_uuid: Uuid::new_v4(),
        tenant: None,
        retries: 0,
    })
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_records");
    for dims in [0usize, 384, 1536] {
        let records: Vec<Record> = (0..1_000).map(|n| object(n, dims)).collect();
        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(dims), &records, |b, records| {
            b.iter(|| frame_records(black_box(records), 10 * 1024 * 1024))
        });
    }
    group.finish();
}

fn bench_pop_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pop_batch");
    let blocked = Uuid::new_v4();
    let exclusion: HashSet<Uuid> = [blocked].into_iter().collect();
    for blocked_share in [0u64, 2, 10] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(
            BenchmarkId::new("one_in", blocked_share),
            &blocked_share,
            |b, &blocked_share| {
                b.iter_batched(
                    || {
                        let queue = RecordQueue::new();
                        queue.extend((0..1_000).map(|n| {
                            if blocked_share > 0 && n % blocked_share == 0 {
                                reference(n, blocked)
                            } else {
                                object(n, 0)
                            }
                        }));
                        queue
                    },
                    |queue| {
                        while !queue.pop_batch(100, &exclusion).is_empty() {}
                        queue
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_framing, bench_pop_batch);
criterion_main!(benches);
