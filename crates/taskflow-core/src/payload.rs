//! Opaque parameter/result envelope.
//!
//! The engine never looks inside a payload; only the action that owns the
//! schema decodes it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A serialized value tagged with the schema that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Schema tag, usually the action name that owns the shape.
    pub schema: String,
    /// The encoded body.
    pub body: Value,
}

impl Payload {
    pub fn new(schema: impl Into<String>, body: Value) -> Self {
        Self {
            schema: schema.into(),
            body,
        }
    }

    /// Encode a typed value under the given schema tag.
    pub fn encode<T: Serialize>(schema: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            schema: schema.into(),
            body: serde_json::to_value(value)?,
        })
    }

    /// Decode the body into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// Look up a nested value by JSON pointer; `None` or `""` selects the whole body.
    pub fn select(&self, pointer: Option<&str>) -> Option<&Value> {
        match pointer {
            None | Some("") => Some(&self.body),
            Some(p) => self.body.pointer(p),
        }
    }
}
