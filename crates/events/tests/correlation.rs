use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use blockscript_core::ManualClock;
use blockscript_events::{
    BusConfig, EventBus, EventData, EventSchema, FieldType, ManualScheduler, Pattern,
    PatternInstance,
};
use serde_json::{Value, json};

fn data(value: Value) -> EventData {
    value.as_object().cloned().unwrap_or_default()
}

fn order_bus(config: BusConfig) -> (Arc<EventBus>, ManualScheduler, Arc<AtomicUsize>) {
    let clock = ManualClock::at_epoch();
    let scheduler = ManualScheduler::new(clock.clone());
    let bus = EventBus::new(config, Arc::new(clock), Arc::new(scheduler.clone()));

    bus.register_schema(
        EventSchema::builder("orderPlaced")
            .required("amount", FieldType::Number)
            .build()
            .unwrap(),
    )
    .unwrap();
    bus.register_schema(EventSchema::builder("orderShipped").build().unwrap())
        .unwrap();

    bus.correlation().register_pattern(
        Pattern::builder("large-order-shipped")
            .step("orderPlaced", |d| {
                d.get("amount").and_then(Value::as_f64).unwrap_or(0.0) > 100.0
            })
            .then("orderShipped")
            .timeout(Duration::from_millis(5000))
            .build()
            .unwrap(),
    );

    let completions = Arc::new(AtomicUsize::new(0));
    let c = completions.clone();
    bus.correlation()
        .add_listener(move |_: &PatternInstance| -> anyhow::Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    (bus, scheduler, completions)
}

#[test]
fn large_order_then_shipment_completes_exactly_once() {
    let (bus, scheduler, completions) = order_bus(BusConfig::default());

    bus.publish("orderPlaced", data(json!({"amount": 150})), None, None)
        .unwrap();
    let active = bus.correlation().active_instances();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].completed_steps().len(), 1);

    scheduler.advance(Duration::from_millis(1000));
    bus.publish("orderShipped", EventData::new(), None, None)
        .unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(bus.correlation().active_count(), 0);

    scheduler.advance(Duration::from_millis(1));
    bus.publish("orderShipped", EventData::new(), None, None)
        .unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(bus.correlation().completed_total(), 1);
}

#[test]
fn small_orders_do_not_start_the_pattern() {
    let (bus, _scheduler, completions) = order_bus(BusConfig::default());

    bus.publish("orderPlaced", data(json!({"amount": 20})), None, None)
        .unwrap();
    bus.publish("orderShipped", EventData::new(), None, None)
        .unwrap();

    assert_eq!(bus.correlation().active_count(), 0);
    assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[test]
fn rejected_events_never_reach_the_engine() {
    let (bus, _scheduler, _) = order_bus(BusConfig::default());

    assert!(
        bus.publish("orderPlaced", data(json!({"amount": "lots"})), None, None)
            .is_err()
    );
    assert_eq!(bus.correlation().active_count(), 0);
}

#[test]
fn periodic_sweep_drops_stale_instances_silently() {
    let config = BusConfig::default().with_sweep_interval(Duration::from_secs(1));
    let (bus, scheduler, completions) = order_bus(config);
    let sweep = bus.start_correlation_sweep();

    bus.publish("orderPlaced", data(json!({"amount": 500})), None, None)
        .unwrap();
    scheduler.advance(Duration::from_secs(5));
    assert_eq!(bus.correlation().active_count(), 1);

    scheduler.advance(Duration::from_secs(1));
    assert_eq!(bus.correlation().active_count(), 0);
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    sweep.cancel();
    bus.publish("orderShipped", EventData::new(), None, None)
        .unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[test]
fn listeners_may_publish_follow_up_events() {
    let (bus, _scheduler, _) = order_bus(BusConfig::default());
    bus.register_schema(
        EventSchema::builder("vipThanks")
            .required("amount", FieldType::Number)
            .build()
            .unwrap(),
    )
    .unwrap();

    let weak = Arc::downgrade(&bus);
    bus.correlation()
        .add_listener(move |instance: &PatternInstance| -> anyhow::Result<()> {
            if let Some(bus) = weak.upgrade() {
                bus.publish("vipThanks", instance.merged_data(), None, None)?;
            }
            Ok(())
        });

    bus.publish("orderPlaced", data(json!({"amount": 250})), None, None)
        .unwrap();
    bus.publish("orderShipped", EventData::new(), None, None)
        .unwrap();

    let history = bus.history("vipThanks");
    assert_eq!(history.len(), 1);
}
