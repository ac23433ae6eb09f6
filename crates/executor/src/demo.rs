//! Demo workflow registered by the executor
//!
//! `start` → `process` → `done`, with `error` as the manual error state.
//! Setting the variable `flaky=true` makes `process` fail its first attempt.

use std::time::Duration;

use stateflow_engine::{FnHandler, HandlerError, StateDefinition, WorkflowDefinition};
use stateflow_engine::definition::{DefinitionError, HandlerResult};
use stateflow_engine::engine::ExecutionContext;

pub const WORKFLOW_TYPE: &str = "demo";

pub fn definition() -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder(WORKFLOW_TYPE)
        .description("Demo workflow: start, process, done")
        .start_state("start")
        .error_state("error")
        .state(
            StateDefinition::start("start")
                .with_description("Record when processing began")
                .with_handler(FnHandler::new(start)),
        )
        .state(
            StateDefinition::normal("process")
                .with_description("Count processing runs")
                .with_handler(FnHandler::new(process))
                .with_max_retries(3)
                .with_execution_warning(Duration::from_secs(5)),
        )
        .state(StateDefinition::end("done").with_description("Processing finished"))
        .state(StateDefinition::manual("error").with_description("Needs operator attention"))
        .permit("start", "process")
        .permit("process", "done")
        .build()
}

fn start(ctx: &mut ExecutionContext) -> HandlerResult {
    ctx.set_variable("started_at", chrono::Utc::now().to_rfc3339());
    Ok(Some(ctx.move_to("process", "demo started")))
}

fn process(ctx: &mut ExecutionContext) -> HandlerResult {
    if ctx.variable("flaky") == Some("true") && ctx.retries() == 0 {
        return Err(HandlerError::new("flaky demo failure").with_retry_delay(Duration::from_secs(1)));
    }

    let runs = ctx
        .variable("runs")
        .map(str::parse::<u32>)
        .transpose()
        .map_err(|e| HandlerError::new(format!("invalid runs variable: {}", e)))?
        .unwrap_or(0);
    ctx.set_variable("runs", runs + 1);
    Ok(Some(ctx.move_to("done", "demo processed")))
}
