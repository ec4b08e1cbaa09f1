//! The read-only run context.
//!
//! A `RunContext` is resolved from the trigger payload before scheduling starts
//! and is never mutated afterwards. Expressions read it through `ctx.<key>`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable map of trigger facts (event, branch, tag, actor, inputs, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    values: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    /// Look up a key. Dotted keys such as `inputs.version` are stored flat.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builder used by trigger resolution and tests.
#[derive(Debug, Default)]
pub struct RunContextBuilder {
    values: BTreeMap<String, Value>,
}

impl RunContextBuilder {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set_if_absent(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    pub fn input(self, name: &str, value: impl Into<Value>) -> Self {
        self.set(format!("inputs.{}", name), value)
    }

    pub fn extend<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (k, v) in entries {
            self.values.insert(k.into(), v.into());
        }
        self
    }

    pub fn build(self) -> RunContext {
        RunContext {
            values: self.values,
        }
    }
}
