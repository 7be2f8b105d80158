//! Sequential operation workflows.
//!
//! A [`Workflow`] is a fixed, ordered list of [`Operation`]s. Each operation
//! declares a strictly validated payload type and an output type; a run takes a
//! map of raw JSON payloads keyed by operation name. Operations without a
//! supplied payload receive the previous operation's output, converted into
//! their payload type. Retries, when wanted, are whole-workflow.

mod context;

pub use context::WorkflowContext;

use std::collections::HashSet;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::Error;

/// A single unit of work inside a workflow.
pub trait Operation: Send + Sync {
    /// Key under which the operation's payload is supplied and its output stored.
    const NAME: &'static str;

    /// Payload types should reject unknown fields (`#[serde(deny_unknown_fields)]`).
    type Payload: DeserializeOwned;
    type Output: Serialize;

    fn execute(
        &self,
        payload: Self::Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<Self::Output, Error>;
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow '{0}' has no operations configured")]
    Empty(&'static str),

    #[error("operation '{0}' is declared more than once")]
    DuplicateOperation(&'static str),

    #[error("unknown payload keys: {}", .0.join(", "))]
    UnknownPayloads(Vec<String>),

    #[error("missing payload for operation: {0}")]
    MissingPayload(&'static str),

    #[error("invalid payload for {operation}: {message}")]
    InvalidPayload {
        operation: &'static str,
        message: String,
    },

    #[error("operation {operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Error,
    },
}

impl From<WorkflowError> for Error {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Operation { source, .. } => source,
            other => Error::Validation(other.to_string()),
        }
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct WorkflowRun {
    /// Output of the last operation.
    pub output: Value,
    /// Every operation's output keyed by operation name.
    pub outputs: Map<String, Value>,
    pub context: WorkflowContext,
}

trait Step: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, raw: &Value) -> Result<(), WorkflowError>;
    fn run(&self, raw: Value, ctx: &mut WorkflowContext) -> Result<Value, WorkflowError>;
}

struct OperationStep<O>(O);

impl<O: Operation> OperationStep<O> {
    fn parse(raw: Value) -> Result<O::Payload, WorkflowError> {
        serde_json::from_value(raw).map_err(|e| WorkflowError::InvalidPayload {
            operation: O::NAME,
            message: e.to_string(),
        })
    }
}

impl<O: Operation> Step for OperationStep<O> {
    fn name(&self) -> &'static str {
        O::NAME
    }

    fn validate(&self, raw: &Value) -> Result<(), WorkflowError> {
        Self::parse(raw.clone()).map(|_| ())
    }

    fn run(&self, raw: Value, ctx: &mut WorkflowContext) -> Result<Value, WorkflowError> {
        let payload = Self::parse(raw)?;
        let output = self
            .0
            .execute(payload, ctx)
            .map_err(|source| WorkflowError::Operation {
                operation: O::NAME,
                source,
            })?;
        serde_json::to_value(output).map_err(|e| WorkflowError::Operation {
            operation: O::NAME,
            source: Error::processing(format!("unserializable output: {e}")),
        })
    }
}

pub struct Workflow {
    name: &'static str,
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("operations", &self.operation_names())
            .finish()
    }
}

impl Workflow {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Appends an operation.
    pub fn then<O: Operation + 'static>(mut self, operation: O) -> Self {
        self.steps.push(Box::new(OperationStep(operation)));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn execute(&self, payloads: Map<String, Value>) -> Result<WorkflowRun, WorkflowError> {
        self.execute_with_context(payloads, WorkflowContext::new())
    }

    /// Runs every operation in order, starting from a pre-seeded context.
    ///
    /// All supplied payloads are checked before the first operation runs.
    pub fn execute_with_context(
        &self,
        mut payloads: Map<String, Value>,
        mut ctx: WorkflowContext,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.check_payloads(&payloads)?;

        let mut previous: Option<Value> = None;
        for step in &self.steps {
            let name = step.name();
            let payload = match payloads.remove(name) {
                Some(payload) => payload,
                None => {
                    // check_payloads guarantees the first step has a payload
                    let Some(prev) = previous.take() else {
                        return Err(WorkflowError::MissingPayload(name));
                    };
                    step.validate(&prev)?;
                    prev
                }
            };

            tracing::debug!(workflow = self.name, operation = name, "running operation");
            let output = step.run(payload, &mut ctx).inspect_err(|e| {
                tracing::warn!(workflow = self.name, operation = name, "operation failed: {}", e);
            })?;
            ctx.record_output(name, output.clone());
            previous = Some(output);
        }

        let outputs = ctx.outputs().clone();
        Ok(WorkflowRun {
            output: previous.unwrap_or(Value::Null),
            outputs,
            context: ctx,
        })
    }

    fn check_payloads(&self, payloads: &Map<String, Value>) -> Result<(), WorkflowError> {
        let Some(first) = self.steps.first() else {
            return Err(WorkflowError::Empty(self.name));
        };

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(WorkflowError::DuplicateOperation(step.name()));
            }
        }

        let mut unknown: Vec<String> = payloads
            .keys()
            .filter(|key| !seen.contains(key.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(WorkflowError::UnknownPayloads(unknown));
        }

        if !payloads.contains_key(first.name()) {
            return Err(WorkflowError::MissingPayload(first.name()));
        }

        for step in &self.steps {
            if let Some(raw) = payloads.get(step.name()) {
                step.validate(raw)?;
            }
        }

        Ok(())
    }
}
