//! Task handlers, choice conditions and value validators.

use async_trait::async_trait;
use ayatori_core::{StepContext, WorkflowError};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The unit of work behind a task step.
///
/// `input` is the workflow input for the first step and the previous step's
/// output otherwise. The returned value becomes the next step's input.
///
/// # Examples
///
/// ```
/// use ayatori::prelude::*;
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// #[derive(Debug)]
/// struct Charge;
///
/// #[async_trait]
/// impl TaskHandler for Charge {
///     async fn handle(&self, input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
///         let amount = input["amount"].as_u64().ok_or_else(|| ctx.error("amount missing"))?;
///         ctx.set_metadata("charged", json!(amount));
///         Ok(json!({"charged": amount}))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, input: Value, ctx: StepContext) -> Result<Value, WorkflowError>;
}

/// A [`TaskHandler`] backed by an async function or closure.
///
/// Created with [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps an async function `(input, ctx) -> Result<Value, WorkflowError>`
/// as a [`TaskHandler`].
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::{json, Value};
///
/// async fn greet(input: Value, _ctx: StepContext) -> Result<Value, WorkflowError> {
///     Ok(json!({"greeting": format!("hello {}", input["name"])}))
/// }
///
/// let step = TaskStep::new(handler_fn(greet));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
    async fn handle(&self, input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
        (self.f)(input, ctx).await
    }
}

#[async_trait]
impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    async fn handle(&self, input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
        (**self).handle(input, ctx).await
    }
}

/// Predicate evaluated by a choice step. An `Err` counts as "no match".
pub type Condition = Arc<dyn Fn(&StepContext) -> Result<bool, WorkflowError> + Send + Sync>;

/// Checks a step's input or output. An `Err` carries the rejection message.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use ayatori_core::Metadata;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "wf",
            Value::Null,
            Metadata::new(),
            CancellationToken::new(),
        )
        .for_step("double", Value::Null, 1)
    }

    async fn double(input: Value, ctx: StepContext) -> Result<Value, WorkflowError> {
        let n = input.as_i64().ok_or_else(|| ctx.error("not a number"))?;
        Ok(json!(n * 2))
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_function() {
        let handler = handler_fn(double);
        let output = handler.handle(json!(21), ctx()).await.expect("handler ok");
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn test_handler_fn_propagates_error() {
        let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn(double));
        let error = handler.handle(json!("x"), ctx()).await.unwrap_err();
        assert_eq!(error.to_string(), "Step failed: double, details: not a number");
    }
}
