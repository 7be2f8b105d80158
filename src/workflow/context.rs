use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Shared state visible to every operation of one workflow run.
///
/// `values` carries derived artifacts that no payload declares; `outputs` holds
/// the outputs of the operations that already ran, keyed by operation name.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    values: Map<String, Value>,
    outputs: Map<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::processing(format!("context value '{key}': {e}")))?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Reads a typed value. A present but mistyped value is an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| Error::processing(format!("context value '{key}': {e}")))
            })
            .transpose()
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub(super) fn record_output(&mut self, operation: &str, output: Value) {
        self.outputs.insert(operation.to_string(), output);
    }
}
