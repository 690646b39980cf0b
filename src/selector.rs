//! Compiled JMESPath selectors over incoming events.
//!
//! A selector is compiled once when the handler is constructed and then
//! evaluated per invocation against the opaque event value. A `null`
//! result is reported as missing; the handler decides whether missing is
//! a bypass or a failure.

use jmespath::{Expression, Variable};
use serde_json::Value;

use crate::error::IdempotencyError;

/// A compiled selector expression.
pub struct Selector {
    expression: Expression<'static>,
    source: String,
}

impl Selector {
    /// Compiles an expression. Fails with
    /// [`IdempotencyError::Configuration`] on a syntax error, so broken
    /// selectors are rejected at construction rather than per invocation.
    pub fn compile(expression: &str) -> Result<Self, IdempotencyError> {
        let compiled = jmespath::compile(expression).map_err(|e| {
            IdempotencyError::configuration(format!(
                "invalid selector expression '{expression}': {e}"
            ))
        })?;
        Ok(Self {
            expression: compiled,
            source: expression.to_string(),
        })
    }

    /// The expression text this selector was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the selector over an event.
    ///
    /// Returns `Ok(None)` when the expression resolves to nothing
    /// (missing path or explicit `null`), otherwise the selected subtree.
    pub fn select(&self, event: &Value) -> Result<Option<Value>, IdempotencyError> {
        let data = Variable::from_json(&event.to_string()).map_err(|e| {
            IdempotencyError::key_extraction(format!("event is not a JSON document: {e}"))
        })?;
        let result = self.expression.search(data).map_err(|e| {
            IdempotencyError::key_extraction(format!(
                "selector '{}' failed to evaluate: {e}",
                self.source
            ))
        })?;

        if result.is_null() {
            return Ok(None);
        }
        let value = serde_json::to_value(result.as_ref()).map_err(|e| {
            IdempotencyError::key_extraction(format!(
                "selector '{}' produced an unserializable value: {e}",
                self.source
            ))
        })?;
        Ok(Some(value))
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("source", &self.source)
            .finish()
    }
}
