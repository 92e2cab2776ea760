//! Nested ground-truth values.

use serde_json::Value;

use crate::errors::{CodecError, Result};

/// A document parse: maps keep their insertion order, sequences keep element
/// order and every scalar is carried as its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredValue {
    Map(Vec<(String, StructuredValue)>),
    Sequence(Vec<StructuredValue>),
    Leaf(String),
}

impl StructuredValue {
    pub fn leaf(text: impl Into<String>) -> Self {
        StructuredValue::Leaf(text.into())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, StructuredValue)>,
    {
        StructuredValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn is_map(&self) -> bool {
        matches!(self, StructuredValue::Map(_))
    }

    /// Looks up `key` in a map value. Returns `None` for non-map values.
    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        match self {
            StructuredValue::Map(entries) => entries
                .iter()
                .find(|(candidate, _)| candidate == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Parses a JSON document. Key order follows the document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from(value))
    }

    pub fn to_json(&self) -> Value {
        match self {
            StructuredValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            StructuredValue::Sequence(items) => {
                Value::Array(items.iter().map(StructuredValue::to_json).collect())
            }
            StructuredValue::Leaf(text) => Value::String(text.clone()),
        }
    }

    /// Requires a map at the top level, which is what a ground-truth parse is.
    pub fn into_map(self) -> Result<Self> {
        if self.is_map() {
            Ok(self)
        } else {
            Err(CodecError::InvalidStructure(
                "ground-truth parse must be a JSON object".into(),
            ))
        }
    }
}

impl From<Value> for StructuredValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => StructuredValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, StructuredValue::from(value)))
                    .collect(),
            ),
            Value::Array(items) => {
                StructuredValue::Sequence(items.into_iter().map(StructuredValue::from).collect())
            }
            Value::String(text) => StructuredValue::Leaf(text),
            Value::Number(number) => StructuredValue::Leaf(number.to_string()),
            // Scalars are rendered the way the annotation tooling printed them.
            Value::Bool(true) => StructuredValue::Leaf("True".into()),
            Value::Bool(false) => StructuredValue::Leaf("False".into()),
            Value::Null => StructuredValue::Leaf("None".into()),
        }
    }
}
