//! Decoded server frames.

use serde_json::Value;

use crate::observability::metrics;

/// One decoded frame: data, or an error value for the current load.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Value),
    Error(String),
}

impl Payload {
    /// Decode a raw text frame.
    ///
    /// Frames that are not JSON, and JSON objects carrying a non-null
    /// `error` field, become [`Payload::Error`].
    pub fn decode(text: &str) -> Payload {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => {
                let detail = match map.get("error") {
                    Some(Value::Null) | None => None,
                    Some(Value::String(detail)) => Some(detail.clone()),
                    Some(other) => Some(other.to_string()),
                };
                match detail {
                    Some(detail) => Payload::Error(detail),
                    None => Payload::Data(Value::Object(map)),
                }
            }
            Ok(value) => Payload::Data(value),
            Err(err) => {
                metrics::record_decode_error();
                tracing::debug!(error = %err, "Undecodable frame");
                Payload::Error(format!("invalid payload: {err}"))
            }
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Payload::Data(value) => Some(value),
            Payload::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }
}
