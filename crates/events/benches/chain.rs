use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{DateTime, Duration};
use serde_json::json;
use tally_core::{ActorId, DeviceId, EventId, EventType, TenantId};
use tally_events::{ChainHash, Event, EventFields, compute_hash, verify_chain};

fn fields(n: i64) -> EventFields {
    let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default();
    EventFields {
        id: EventId::new(),
        event_type: EventType::from_static("ORDER_ITEM_ADDED"),
        actor_id: ActorId::new("cashier-1").unwrap(),
        payload: json!({
            "orderId": format!("A{n}"),
            "menuItemId": "m-12",
            "menuItemName": "Shakshuka",
            "quantity": 2,
            "unitPrice": 85.5,
            "modifiers": [{"name": "extra feta", "price": 12}],
        }),
        device_id: DeviceId::new("pos-7").unwrap(),
        tenant_id: TenantId::new("brunch-co").unwrap(),
        timestamp: start + Duration::milliseconds(n),
    }
}

fn build_chain(len: usize) -> Vec<Event> {
    let mut prev = ChainHash::genesis();
    let mut out = Vec::with_capacity(len);
    for n in 0..len {
        let event = fields(n as i64).seal(prev).unwrap();
        prev = event.hash().clone();
        out.push(event);
    }
    out
}

fn bench_compute_hash(c: &mut Criterion) {
    let f = fields(0);
    let prev = ChainHash::genesis();

    c.bench_function("compute_hash/order_item_added", |b| {
        b.iter(|| compute_hash(black_box(&prev), black_box(&f)).unwrap())
    });
}

fn bench_verify_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_chain");

    for len in [100usize, 1_000, 10_000] {
        let chain = build_chain(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &chain, |b, chain| {
            b.iter(|| verify_chain(&ChainHash::genesis(), black_box(chain)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compute_hash, bench_verify_chain);
criterion_main!(benches);
