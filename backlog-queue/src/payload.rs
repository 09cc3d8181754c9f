//! Opaque work items and processing outcomes.

use crate::error::QueueResult;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

/// One serialized work item. The coordinator never looks inside.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialize a value as JSON.
    ///
    /// ```
    /// use backlog_queue::Payload;
    /// use serde_json::json;
    ///
    /// let payload = Payload::json(&json!({"email": "a@example.com"})).unwrap();
    /// let value: serde_json::Value = payload.decode().unwrap();
    /// assert_eq!(value["email"], "a@example.com");
    /// ```
    pub fn json<T: Serialize + ?Sized>(value: &T) -> QueueResult<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Serialize a JSON value.
    pub fn from_value(value: serde_json::Value) -> Self {
        // Serializing a Value into memory cannot fail.
        Self(value.to_string().into_bytes())
    }

    /// Decode the JSON content.
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "Payload({:?})", text),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(value)
    }
}

/// Result of processing one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; nothing left to do.
    Success,
    /// The payload can never succeed (malformed data). It is dropped.
    PermanentFailure(String),
    /// A dependency is unavailable. The payload moves to the next generation.
    TransientFailure(String),
}

impl Outcome {
    /// Whether the payload has been dealt with for good.
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::TransientFailure(_))
    }
}
