//! Record field access.
//!
//! The enricher never assumes a concrete payload type. It reads the text
//! and writes its output through the [`Record`] trait, using the field
//! names configured in [`RecordFields`].

use crate::config::EnricherConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Names of the fields the enricher reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFields {
    pub text: String,
    pub embedding: String,
    pub error: String,
}

impl RecordFields {
    pub fn from_config(config: &EnricherConfig) -> Self {
        Self {
            text: config.text_field.clone(),
            embedding: config.embedding_field.clone(),
            error: config.error_field.clone(),
        }
    }
}

impl Default for RecordFields {
    fn default() -> Self {
        Self {
            text: "text".to_string(),
            embedding: "embedding".to_string(),
            error: "error".to_string(),
        }
    }
}

/// A pipeline record the enricher can annotate.
///
/// Implementations must keep the two outputs exclusive: setting an
/// embedding clears any error and setting an error clears any embedding.
pub trait Record: Send + 'static {
    /// The text to embed, or `None` when the field is absent or not a string
    fn text(&self, fields: &RecordFields) -> Option<&str>;

    /// Attach a computed vector
    fn set_embedding(&mut self, fields: &RecordFields, embedding: Vec<f32>);

    /// Attach a human-readable failure reason
    fn set_error(&mut self, fields: &RecordFields, reason: String);
}

/// A JSON document record, the shape most pipelines hand over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRecord(pub Value);

impl JsonRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    /// The embedding written by the enricher, if any
    pub fn embedding(&self, fields: &RecordFields) -> Option<Vec<f32>> {
        self.0.get(&fields.embedding)?.as_array().map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect()
        })
    }

    /// The error written by the enricher, if any
    pub fn error(&self, fields: &RecordFields) -> Option<&str> {
        self.0.get(&fields.error)?.as_str()
    }

    // Non-object payloads are wrapped so the output field has somewhere to live.
    fn update(&mut self, edit: impl FnOnce(&mut Map<String, Value>)) {
        let mut map = match std::mem::take(&mut self.0) {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        edit(&mut map);
        self.0 = Value::Object(map);
    }
}

impl From<Value> for JsonRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Record for JsonRecord {
    fn text(&self, fields: &RecordFields) -> Option<&str> {
        self.0.get(&fields.text)?.as_str()
    }

    fn set_embedding(&mut self, fields: &RecordFields, embedding: Vec<f32>) {
        self.update(|map| {
            map.remove(&fields.error);
            map.insert(
                fields.embedding.clone(),
                Value::Array(embedding.into_iter().map(Value::from).collect()),
            );
        });
    }

    fn set_error(&mut self, fields: &RecordFields, reason: String) {
        self.update(|map| {
            map.remove(&fields.embedding);
            map.insert(fields.error.clone(), Value::String(reason));
        });
    }
}
