//! Simple two-step workflow example.

use ayatori::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

async fn load_data(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
    println!("Loading data for {}...", input["dataset"]);
    ctx.set_metadata("loaded_by", json!(ctx.step_name().as_str()));
    Ok(json!({"rows": ["alpha", "beta", "gamma"]}))
}

async fn summarize(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
    let rows = input["rows"]
        .as_array()
        .ok_or_else(|| ctx.error("rows missing"))?;
    Ok(json!({
        "count": rows.len(),
        "loaded_by": ctx.get_metadata("loaded_by"),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let service = WorkflowService::new();
    service.register(
        Workflow::builder("load_and_summarize")
            .task("load", TaskStep::from_fn(load_data))
            .task("summarize", TaskStep::from_fn(summarize))
            .build()?,
    )?;

    let id = service
        .start("load_and_summarize", json!({"dataset": "sample"}))
        .await?;
    let instance = service.wait_for(id, Duration::from_secs(5)).await?;

    match instance.status {
        InstanceStatus::Completed => {
            println!("Workflow completed successfully");
            if let Some(output) = instance.output {
                println!("Output: {}", output);
            }
        }
        status => eprintln!("Workflow ended {}: {:?}", status, instance.error),
    }

    Ok(())
}
