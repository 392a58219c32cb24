use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};

use blockscript_events::{
    ChainStep, DataTemplate, EventData, EventSchema, FieldType, Handler, Pattern, PatternInstance,
    Trigger,
};
use blockscript_runtime::Runtime;

fn main() -> anyhow::Result<()> {
    blockscript_observability::init();

    let runtime = Runtime::from_env().context("failed to start runtime")?;
    let bus = runtime.bus();

    bus.register_schema(
        EventSchema::builder("orderPlaced")
            .required("orderId", FieldType::Integer)
            .required("amount", FieldType::Number)
            .tag("orders")
            .build()?,
    )?;
    bus.register_schema(
        EventSchema::builder("orderShipped")
            .required("orderId", FieldType::Integer)
            .tag("orders")
            .build()?,
    )?;
    bus.register_schema(
        EventSchema::builder("customerNotified")
            .required("orderId", FieldType::Integer)
            .optional_with_default("channel", FieldType::String, "email")
            .build()?,
    )?;
    bus.register_schema(
        EventSchema::builder("vipOrderCompleted")
            .optional("amount", FieldType::Number)
            .build()?,
    )?;

    for event in ["orderPlaced", "orderShipped", "customerNotified", "vipOrderCompleted"] {
        bus.register_handler(
            event,
            Handler::from_fn(|event| {
                tracing::info!(event = %event.name, data = %serde_json::Value::Object(event.data.clone()), "handled");
                Ok(())
            }),
        )?;
    }

    bus.correlation().register_pattern(
        Pattern::builder("large-order-shipped")
            .step("orderPlaced", |d| {
                d.get("amount").and_then(Value::as_f64).unwrap_or(0.0) > 100.0
            })
            .then("orderShipped")
            .timeout(Duration::from_secs(5))
            .build()?,
    );
    let weak_bus = std::sync::Arc::downgrade(bus);
    bus.correlation()
        .add_listener(move |instance: &PatternInstance| -> anyhow::Result<()> {
            let Some(bus) = weak_bus.upgrade() else {
                return Ok(());
            };
            let mut data = EventData::new();
            if let Some(amount) = instance.merged_data().get("amount") {
                data.insert("amount".to_string(), amount.clone());
            }
            bus.publish("vipOrderCompleted", data, instance.initiating_actor().copied(), None)?;
            Ok(())
        });

    // Every shipment schedules a customer notification shortly afterwards.
    bus.register_trigger(
        Trigger::builder("orderShipped")
            .on("orderPlaced")
            .data(DataTemplate::new().copy("orderId", "orderId"))
            .then(
                ChainStep::new("customerNotified")
                    .with_data(DataTemplate::new().copy("orderId", "orderId"))
                    .after(Duration::from_millis(100)),
            )
            .repeat(0, Duration::ZERO)
            .build(),
    );

    for (order_id, amount) in [(1, 150.0), (2, 40.0)] {
        let data = object(json!({"orderId": order_id, "amount": amount}));
        let report = bus.publish("orderPlaced", data, None, None)?;
        tracing::info!(
            order_id,
            handlers = report.handlers_invoked,
            "order placed"
        );
    }

    std::thread::sleep(Duration::from_millis(300));

    for name in bus.schema_names() {
        let history = bus.history(&name);
        tracing::info!(event = %name, dispatches = history.len(), "history");
    }
    tracing::info!(
        completed_patterns = bus.correlation().completed_total(),
        "demo finished"
    );

    runtime.shutdown()?;
    Ok(())
}

fn object(value: Value) -> EventData {
    value.as_object().cloned().unwrap_or_default()
}
