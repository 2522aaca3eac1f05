//! Uniform JSON response envelope.
//!
//! Every JSON response the gateway emits has the same shape: successes are
//! `{"status": true, ...payload}` and failures are
//! `{"status": false, "msg": "..."}`. Both carry `author` and `timestamp`
//! attribution fields regardless of outcome. Route handlers produce an
//! [`Outcome`]; serialization into the wire shape happens in exactly one
//! place so the contract cannot drift per route.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// Tagged result of a route handler, prior to envelope rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful response payload. Object payloads are flattened into the
    /// envelope; any other JSON value is nested under `result`.
    Success(Value),
    /// Failure message rendered as `msg`.
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

impl From<&GatewayError> for Outcome {
    fn from(err: &GatewayError) -> Self {
        Outcome::Failure(err.to_string())
    }
}

/// Renders outcomes into the wire envelope with fixed attribution.
#[derive(Debug, Clone)]
pub struct Envelope {
    author: String,
}

impl Envelope {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
        }
    }

    /// Render an outcome into the final JSON object.
    ///
    /// Attribution fields are written last so a payload cannot override
    /// `status`, `author`, or `timestamp`.
    pub fn render(&self, outcome: &Outcome) -> Value {
        let mut body = Map::new();

        match outcome {
            Outcome::Success(payload) => {
                match payload {
                    Value::Object(fields) => {
                        for (k, v) in fields {
                            body.insert(k.clone(), v.clone());
                        }
                    }
                    Value::Null => {}
                    other => {
                        body.insert("result".to_string(), other.clone());
                    }
                }
                body.insert("status".to_string(), Value::Bool(true));
            }
            Outcome::Failure(msg) => {
                body.insert("status".to_string(), Value::Bool(false));
                body.insert("msg".to_string(), Value::String(msg.clone()));
            }
        }

        body.insert("author".to_string(), Value::String(self.author.clone()));
        body.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        Value::Object(body)
    }

    /// Shorthand for rendering a success payload.
    pub fn success(&self, payload: Value) -> Value {
        self.render(&Outcome::Success(payload))
    }

    /// Shorthand for rendering a failure message.
    pub fn failure(&self, msg: impl Into<String>) -> Value {
        self.render(&Outcome::Failure(msg.into()))
    }

    pub fn author(&self) -> &str {
        &self.author
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new("mediagate")
    }
}
