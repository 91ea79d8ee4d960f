//! Order processing workflow.
//!
//! Demonstrates:
//! - Typed step input via serde
//! - Routing on the previous output with a choice step
//! - Fan-out into parallel branches
//! - Retrying a flaky payment gateway
//! - Observing lifecycle events

use ayatori::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    items: Vec<OrderItem>,
    payment: PaymentMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderItem {
    product_id: String,
    quantity: u32,
    price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PaymentMethod {
    CreditCard,
    BankTransfer,
}

fn parse_order(input: Value, ctx: &StepContext) -> Result<Order, WorkflowError> {
    serde_json::from_value(input).map_err(|e| ctx.error(format!("invalid order: {}", e)))
}

async fn validate_order(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
    println!("Validating order...");
    let order = parse_order(input, &ctx)?;
    let total: f64 = order
        .items
        .iter()
        .map(|item| item.price * f64::from(item.quantity))
        .sum();
    ctx.set_metadata("order_id", json!(order.id));
    ctx.set_metadata("total", json!(total));
    serde_json::to_value(&order).map_err(|e| ctx.error(e.to_string()))
}

fn charge_card(gateway_calls: Arc<AtomicU32>) -> TaskStep {
    TaskStep::from_fn(move |input, ctx: StepContext| {
        let call = gateway_calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            println!("Charging card (attempt {})...", ctx.attempt());
            if call < 2 {
                return Err(ctx.error("payment gateway unavailable"));
            }
            let order = parse_order(input, &ctx)?;
            Ok(json!({"order_id": order.id, "transaction": "CC-TRANS-123"}))
        }
    })
    .retry(RetryPolicy::exponential(3, Duration::from_millis(50)))
}

async fn await_transfer(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
    let order = parse_order(input, &ctx)?;
    println!("Payment pending for order {}. Please complete the transfer.", order.id);
    Ok(json!({"order_id": order.id, "status": "pending_transfer"}))
}

fn fulfilment() -> Result<ParallelStep, WorkflowError> {
    let shipping = Branch::builder()
        .task(
            "arrange_shipping",
            TaskStep::from_fn(|input, _ctx| async move {
                println!("Arranging shipping...");
                let order_id = input["order_id"].as_str().unwrap_or("?");
                Ok(json!({"tracking": format!("TRACK-{}", order_id)}))
            }),
        )
        .build()?;
    let invoice = Branch::builder()
        .task(
            "issue_invoice",
            TaskStep::from_fn(|_input, ctx: StepContext| async move {
                println!("Issuing invoice...");
                Ok(json!({"amount": ctx.get_metadata("total")}))
            }),
        )
        .build()?;

    Ok(ParallelStep::new()
        .branch("shipping", shipping)
        .branch("invoice", invoice)
        .on_error(ParallelErrorPolicy::WaitAll))
}

async fn notify(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
    println!(
        "Order {} successful! Tracking: {}, invoiced: {}",
        ctx.get_metadata("order_id").unwrap_or(Value::Null),
        input["shipping"]["tracking"],
        input["invoice"]["amount"]
    );
    Ok(input)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let gateway_calls = Arc::new(AtomicU32::new(0));
    let workflow = Workflow::builder("order_processing")
        .task("validate", TaskStep::from_fn(validate_order))
        .choice(
            "payment_route",
            ChoiceStep::new()
                .when(|ctx| ctx.prev()["payment"] == "credit_card", "charge_card")
                .when(|ctx| ctx.prev()["payment"] == "bank_transfer", "await_transfer"),
        )
        .task("charge_card", charge_card(Arc::clone(&gateway_calls)))
        .parallel("fulfil", fulfilment()?)
        .task("notify", TaskStep::from_fn(notify).end())
        .task("await_transfer", TaskStep::from_fn(await_transfer))
        .timeout(Duration::from_secs(10))
        .build()?;

    let service = WorkflowService::new();
    service.register(workflow)?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let WorkflowEvent::StepRetrying { step, delay_ms, .. } = &event {
                println!("  retrying {} in {}ms", step, delay_ms);
            }
        }
    });

    let order = Order {
        id: "ORD-123".to_string(),
        items: vec![
            OrderItem {
                product_id: "PROD-001".to_string(),
                quantity: 2,
                price: 29.99,
            },
            OrderItem {
                product_id: "PROD-002".to_string(),
                quantity: 1,
                price: 49.99,
            },
        ],
        payment: PaymentMethod::CreditCard,
    };

    let id = service
        .start("order_processing", serde_json::to_value(&order)?)
        .await?;
    let instance = service.wait_for(id, Duration::from_secs(10)).await?;

    match instance.status {
        InstanceStatus::Completed => println!("\nWorkflow completed successfully"),
        status => eprintln!("\nWorkflow ended {}: {:?}", status, instance.error),
    }
    println!(
        "Gateway calls: {}, metadata: {:?}",
        gateway_calls.load(Ordering::SeqCst),
        instance.metadata
    );

    service.stop();
    Ok(())
}
