//! Runs one two-step workflow end to end against a WAL in a temp directory.
//!
//! ```bash
//! cargo run -p windlass-runtime --example single_flow
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use windlass_runtime::coordinator::Advanced;
use windlass_runtime::worker::{StepContext, StepFailure, StepHandler};
use windlass_runtime::{Engine, EngineConfig};

struct PaymentHandler;

#[async_trait]
impl StepHandler for PaymentHandler {
    async fn handle(&self, step: &str, ctx: StepContext) -> Result<Value, StepFailure> {
        tracing::info!(step, workflow_id = %ctx.workflow_id, attempt = ctx.attempt, "executing");
        match step {
            "reserve_funds" => Ok(json!({"reservation": "r-831"})),
            "capture" => Ok(json!({"captured": true})),
            other => Err(StepFailure::fatal(format!("unknown step {other}"))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir = std::env::temp_dir().join("windlass-single-flow");
    let engine = Engine::open(EngineConfig::new(&data_dir))?;

    let workflow_id = engine.create_workflow(
        "payment",
        json!({"amount_cents": 1299}),
        vec!["reserve_funds".into(), "capture".into()],
    )?;
    tracing::info!(%workflow_id, "workflow created");

    let worker = engine.worker("worker-1", Arc::new(PaymentHandler));
    loop {
        match engine.advance(&workflow_id) {
            Ok(Advanced::Scheduled { step, attempt }) => {
                tracing::info!(step, attempt, "scheduled");
                worker.poll_now().await;
            }
            Ok(Advanced::Completed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    let state = engine.workflow_state(&workflow_id)?;
    tracing::info!(status = ?state.status, output = ?state.output, "workflow finished");
    println!(
        "workflow {workflow_id} finished with {} events; output = {}",
        state.version,
        state.output.unwrap_or(Value::Null)
    );
    Ok(())
}
