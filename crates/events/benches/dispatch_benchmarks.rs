use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use blockscript_core::{ManualClock, ScopeId};
use blockscript_events::{
    BusConfig, EventBus, EventData, EventSchema, FieldType, Handler, ManualScheduler, Pattern,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn new_bus() -> Arc<EventBus> {
    let clock = ManualClock::at_epoch();
    let scheduler = ManualScheduler::new(clock.clone());
    EventBus::new(BusConfig::default(), Arc::new(clock), Arc::new(scheduler))
}

fn payload() -> EventData {
    json!({"player": "alice", "amount": 42})
        .as_object()
        .cloned()
        .unwrap_or_default()
}

fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fan_out");

    for handlers in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*handlers as u64));
        group.bench_with_input(
            BenchmarkId::new("global_handlers", handlers),
            handlers,
            |b, &count| {
                let bus = new_bus();
                bus.register_schema(
                    EventSchema::builder("blockBroken")
                        .required("player", FieldType::String)
                        .optional("amount", FieldType::Integer)
                        .build()
                        .unwrap(),
                )
                .unwrap();
                for i in 0..count {
                    bus.register_handler(
                        "blockBroken",
                        Handler::from_fn(|event| {
                            black_box(event.get("amount"));
                            Ok(())
                        })
                        .with_priority((i % 7) as i32),
                    )
                    .unwrap();
                }

                b.iter(|| {
                    black_box(
                        bus.publish("blockBroken", payload(), None, None)
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

fn bench_local_scope_filtering(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_scope_filtering");

    group.bench_function("one_scope_of_50", |b| {
        let bus = new_bus();
        bus.register_schema(EventSchema::builder("chat").local().build().unwrap())
            .unwrap();
        for i in 0..50 {
            bus.register_handler(
                "chat",
                Handler::from_fn(|_| Ok(())).in_scope(ScopeId::new(format!("realm-{i}"))),
            )
            .unwrap();
        }
        let scope = ScopeId::new("realm-7");

        b.iter(|| {
            black_box(
                bus.publish("chat", EventData::new(), None, Some(scope.clone()))
                    .unwrap(),
            );
        });
    });

    group.finish();
}

fn bench_correlation_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation_overhead");

    for patterns in [0usize, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("patterns", patterns),
            patterns,
            |b, &count| {
                let bus = new_bus();
                bus.register_schema(EventSchema::builder("tick").build().unwrap())
                    .unwrap();
                for i in 0..count {
                    bus.correlation().register_pattern(
                        Pattern::builder(format!("p{i}"))
                            .then("never")
                            .then("tick")
                            .timeout(Duration::from_secs(60))
                            .build()
                            .unwrap(),
                    );
                }

                b.iter(|| {
                    black_box(bus.publish("tick", EventData::new(), None, None).unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_local_scope_filtering,
    bench_correlation_overhead
);
criterion_main!(benches);
