use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use blockscript_core::{ActorId, ManualClock, ScopeId};
use blockscript_events::{
    BusConfig, DispatchOutcome, DispatchReport, EventBus, EventData, EventError, EventResult,
    EventSchema, FieldType, Handler, ManualScheduler,
};
use proptest::prelude::*;
use serde_json::{Value, json};

fn bus_with(config: BusConfig) -> Arc<EventBus> {
    let clock = ManualClock::at_epoch();
    let scheduler = ManualScheduler::new(clock.clone());
    EventBus::new(config, Arc::new(clock), Arc::new(scheduler))
}

fn bus() -> Arc<EventBus> {
    bus_with(BusConfig::default())
}

fn data(value: Value) -> EventData {
    value.as_object().cloned().unwrap_or_default()
}

fn simple_schema(name: &str) -> EventSchema {
    EventSchema::builder(name).build().unwrap()
}

/// A handler that appends `label` to a shared log.
fn recording(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Handler {
    let log = log.clone();
    let label = label.to_string();
    Handler::from_fn(move |_| {
        log.lock().unwrap().push(label.clone());
        Ok(())
    })
}

#[test]
fn publishing_unknown_event_fails_and_records_nothing() {
    let bus = bus();
    let err = bus
        .publish("nope", EventData::new(), None, None)
        .unwrap_err();
    assert_eq!(err, EventError::unknown_event("nope"));
    assert!(bus.history("nope").is_empty());
}

#[test]
fn registering_a_handler_for_unknown_event_fails() {
    let bus = bus();
    let err = bus
        .register_handler("nope", Handler::from_fn(|_| Ok(())))
        .unwrap_err();
    assert!(matches!(err, EventError::UnknownEvent { .. }));
}

#[test]
fn duplicate_schema_is_rejected_but_replace_keeps_handlers() {
    let bus = bus();
    bus.register_schema(simple_schema("tick")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("tick", recording(&log, "h")).unwrap();

    let err = bus.register_schema(simple_schema("tick")).unwrap_err();
    assert_eq!(
        err,
        EventError::DuplicateSchema {
            name: "tick".to_string()
        }
    );

    bus.replace_schema(
        EventSchema::builder("tick")
            .required("n", FieldType::Integer)
            .build()
            .unwrap(),
    );
    assert_eq!(bus.handler_count("tick"), 1);
    assert!(bus.publish("tick", EventData::new(), None, None).is_err());
    bus.publish("tick", data(json!({"n": 1})), None, None).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["h"]);
}

#[test]
fn validation_failure_names_every_field_and_runs_nothing() {
    let bus = bus();
    bus.register_schema(
        EventSchema::builder("trade")
            .required("item", FieldType::String)
            .required("count", FieldType::Integer)
            .optional("note", FieldType::String)
            .build()
            .unwrap(),
    )
    .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("trade", recording(&log, "h")).unwrap();

    let err = bus
        .publish("trade", data(json!({"count": "three"})), None, None)
        .unwrap_err();

    let mut fields = err.offending_fields();
    fields.sort();
    assert_eq!(fields, vec!["count", "item"]);
    assert!(log.lock().unwrap().is_empty());

    let history = bus.history("trade");
    assert_eq!(history.len(), 1);
    assert!(matches!(history[0].outcome, DispatchOutcome::Rejected { .. }));
}

#[test]
fn defaults_are_applied_before_handlers_see_the_event() {
    let bus = bus();
    bus.register_schema(
        EventSchema::builder("greet")
            .optional_with_default("greeting", FieldType::String, "hello")
            .build()
            .unwrap(),
    )
    .unwrap();
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    bus.register_handler(
        "greet",
        Handler::from_fn(move |event| {
            *s.lock().unwrap() = event.get("greeting").cloned();
            Ok(())
        }),
    )
    .unwrap();

    bus.publish("greet", EventData::new(), None, None).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(json!("hello")));
}

#[test]
fn failing_and_panicking_handlers_do_not_stop_dispatch() {
    let bus = bus();
    bus.register_schema(simple_schema("boom")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    bus.register_handler("boom", recording(&log, "first").with_priority(10))
        .unwrap();
    bus.register_handler(
        "boom",
        Handler::from_fn(|_| anyhow::bail!("script error")).with_priority(5),
    )
    .unwrap();
    bus.register_handler(
        "boom",
        Handler::from_fn(|_| panic!("script panic")).with_priority(4),
    )
    .unwrap();
    bus.register_handler("boom", recording(&log, "last").with_priority(1))
        .unwrap();

    let report = bus.publish("boom", EventData::new(), None, None).unwrap();

    assert_eq!(report.handlers_invoked, 4);
    assert_eq!(report.handlers_failed, 2);
    assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);
}

#[test]
fn one_shot_schema_is_consumed_by_first_dispatch_with_handlers() {
    let bus = bus();
    bus.register_schema(EventSchema::builder("firstBlood").one_shot().build().unwrap())
        .unwrap();

    // No handlers yet: the schema stays.
    let report = bus
        .publish("firstBlood", EventData::new(), None, None)
        .unwrap();
    assert!(!report.one_shot_consumed);

    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("firstBlood", recording(&log, "h"))
        .unwrap();
    let report = bus
        .publish("firstBlood", EventData::new(), None, None)
        .unwrap();
    assert!(report.one_shot_consumed);
    assert!(!bus.has_schema("firstBlood"));

    let err = bus
        .publish("firstBlood", EventData::new(), None, None)
        .unwrap_err();
    assert!(matches!(err, EventError::UnknownEvent { .. }));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn one_shot_cannot_be_dispatched_again_from_its_own_handler() {
    let bus = bus();
    bus.register_schema(EventSchema::builder("boss").one_shot().build().unwrap())
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let nested: Arc<Mutex<Option<EventResult<DispatchReport>>>> = Arc::new(Mutex::new(None));

    let weak = Arc::downgrade(&bus);
    let (c, n) = (calls.clone(), nested.clone());
    bus.register_handler(
        "boss",
        Handler::from_fn(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(bus) = weak.upgrade() {
                    let again = bus.publish("boss", EventData::new(), None, None);
                    *n.lock().unwrap() = Some(again);
                }
            }
            Ok(())
        }),
    )
    .unwrap();

    let report = bus.publish("boss", EventData::new(), None, None).unwrap();
    assert!(report.one_shot_consumed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        nested.lock().unwrap().take(),
        Some(Err(EventError::UnknownEvent { .. }))
    ));
    assert!(!bus.has_schema("boss"));
}

#[test]
fn concurrent_publishes_consume_a_one_shot_exactly_once() {
    let bus = bus();
    bus.register_schema(EventSchema::builder("jackpot").one_shot().build().unwrap())
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    bus.register_handler(
        "jackpot",
        Handler::from_fn(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let bus = bus.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                bus.publish("jackpot", EventData::new(), None, None)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(winners[0].one_shot_consumed);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| matches!(err, EventError::UnknownEvent { .. }))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_changes_during_dispatch_apply_from_the_next_publish() {
    let bus = bus();
    bus.register_schema(simple_schema("roll")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let doomed = bus.register_handler("roll", recording(&log, "doomed")).unwrap();
    let weak = Arc::downgrade(&bus);
    let (l, late) = (log.clone(), recording(&log, "late"));
    let once = Arc::new(AtomicUsize::new(0));
    bus.register_handler(
        "roll",
        Handler::from_fn(move |_| {
            l.lock().unwrap().push("editor".to_string());
            if once.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(bus) = weak.upgrade() {
                    bus.unregister_handler("roll", doomed);
                    bus.register_handler("roll", late.clone())?;
                }
            }
            Ok(())
        })
        .with_priority(10),
    )
    .unwrap();

    let report = bus.publish("roll", EventData::new(), None, None).unwrap();
    assert_eq!(report.handlers_invoked, 2);
    assert_eq!(*log.lock().unwrap(), vec!["editor", "doomed"]);

    log.lock().unwrap().clear();
    bus.publish("roll", EventData::new(), None, None).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["editor", "late"]);
}

#[test]
fn local_schema_filters_handlers_by_scope() {
    let bus = bus();
    bus.register_schema(EventSchema::builder("chat").local().build().unwrap())
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let north = ScopeId::new("north");
    let south = ScopeId::new("south");

    bus.register_handler("chat", recording(&log, "north").in_scope(north.clone()))
        .unwrap();
    bus.register_handler("chat", recording(&log, "south").in_scope(south))
        .unwrap();
    bus.register_handler("chat", recording(&log, "anywhere"))
        .unwrap();

    bus.publish("chat", EventData::new(), None, Some(north))
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["north", "anywhere"]);

    log.lock().unwrap().clear();
    bus.publish("chat", EventData::new(), None, None).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["anywhere"]);
}

#[test]
fn global_schema_ignores_handler_scope() {
    let bus = bus();
    bus.register_schema(simple_schema("weather")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler(
        "weather",
        recording(&log, "scoped").in_scope(ScopeId::new("east")),
    )
    .unwrap();

    bus.publish("weather", EventData::new(), None, Some(ScopeId::new("west")))
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["scoped"]);
}

#[test]
fn nested_publish_runs_depth_first() {
    let bus = bus();
    bus.register_schema(simple_schema("outer")).unwrap();
    bus.register_schema(simple_schema("inner")).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&bus);
    let l = log.clone();
    bus.register_handler(
        "outer",
        Handler::from_fn(move |_| {
            l.lock().unwrap().push("outer-high".to_string());
            if let Some(bus) = weak.upgrade() {
                bus.publish("inner", EventData::new(), None, None)?;
            }
            Ok(())
        })
        .with_priority(10),
    )
    .unwrap();
    bus.register_handler("outer", recording(&log, "outer-low"))
        .unwrap();
    bus.register_handler("inner", recording(&log, "inner"))
        .unwrap();

    bus.publish("outer", EventData::new(), None, None).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer-high", "inner", "outer-low"]
    );
}

#[test]
fn cyclic_publish_stops_at_the_depth_limit() {
    let bus = bus_with(BusConfig::default().with_max_dispatch_depth(4));
    bus.register_schema(simple_schema("echo")).unwrap();
    let calls = Arc::new(Mutex::new(0usize));

    let weak = Arc::downgrade(&bus);
    let c = calls.clone();
    bus.register_handler(
        "echo",
        Handler::from_fn(move |_| {
            *c.lock().unwrap() += 1;
            if let Some(bus) = weak.upgrade() {
                bus.publish("echo", EventData::new(), None, None)?;
            }
            Ok(())
        }),
    )
    .unwrap();

    let report = bus.publish("echo", EventData::new(), None, None).unwrap();
    assert_eq!(report.depth, 1);
    assert_eq!(*calls.lock().unwrap(), 4);

    let rejected = bus
        .history("echo")
        .into_iter()
        .filter(|r| matches!(r.outcome, DispatchOutcome::Rejected { .. }))
        .count();
    assert_eq!(rejected, 1);

    // The guard unwinds fully: a fresh publish starts at depth 1 again.
    let report = bus.publish("echo", EventData::new(), None, None).unwrap();
    assert_eq!(report.depth, 1);
}

#[test]
fn unregistering_an_actor_drops_only_its_handlers() {
    let bus = bus();
    bus.register_schema(simple_schema("a")).unwrap();
    bus.register_schema(simple_schema("b")).unwrap();
    let author = ActorId::new();

    bus.register_handler("a", Handler::from_fn(|_| Ok(())).owned_by(author))
        .unwrap();
    bus.register_handler("b", Handler::from_fn(|_| Ok(())).owned_by(author))
        .unwrap();
    let kept = bus
        .register_handler("b", Handler::from_fn(|_| Ok(())))
        .unwrap();

    assert_eq!(bus.unregister_handlers_for_actor(&author), 2);
    assert_eq!(bus.handler_count("a"), 0);
    assert_eq!(bus.handler_count("b"), 1);
    assert!(bus.unregister_handler("b", kept));
    assert!(!bus.unregister_handler("b", kept));
}

#[test]
fn history_is_bounded_per_event() {
    let bus = bus_with(BusConfig::default().with_history_capacity(2));
    bus.register_schema(simple_schema("tick")).unwrap();
    for _ in 0..5 {
        bus.publish("tick", EventData::new(), None, None).unwrap();
    }
    assert_eq!(bus.history("tick").len(), 2);

    bus.clear_history("tick");
    assert!(bus.history("tick").is_empty());
}

#[test]
fn schemas_can_be_found_by_tag() {
    let bus = bus();
    bus.register_schema(EventSchema::builder("b").tag("combat").build().unwrap())
        .unwrap();
    bus.register_schema(EventSchema::builder("a").tag("combat").build().unwrap())
        .unwrap();
    bus.register_schema(simple_schema("c")).unwrap();

    let tagged: Vec<String> = bus
        .schemas_tagged("combat")
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(tagged, vec!["a", "b"]);
    assert_eq!(bus.schema_names(), vec!["a", "b", "c"]);
}

proptest! {
    #[test]
    fn handlers_run_by_descending_priority_then_registration(
        priorities in proptest::collection::vec(-3i32..3, 1..12)
    ) {
        let bus = bus();
        bus.register_schema(simple_schema("evt")).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (idx, priority) in priorities.iter().copied().enumerate() {
            let order = order.clone();
            bus.register_handler(
                "evt",
                Handler::from_fn(move |_| {
                    order.lock().unwrap().push((priority, idx));
                    Ok(())
                })
                .with_priority(priority),
            )
            .unwrap();
        }

        bus.publish("evt", EventData::new(), None, None).unwrap();

        let mut expected: Vec<(i32, usize)> =
            priorities.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
        expected.sort_by_key(|&(p, i)| (std::cmp::Reverse(p), i));
        prop_assert_eq!(order.lock().unwrap().clone(), expected);
    }
}
