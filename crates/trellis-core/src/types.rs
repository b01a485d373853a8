use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::traits::RequestManager;

/// Unique identifier of one model request.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arguments handed to a [`LanguageModel`](crate::traits::LanguageModel).
#[derive(Clone, Default)]
pub struct ModelRequest {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Name of the root node of the running graph.
    pub chat_id: String,
    /// Conversation to continue, `None` for a one-shot exchange.
    pub conv_id: Option<String>,
    pub new_conv: bool,
    pub request_id: RequestId,
    pub request_manager: Option<Arc<dyn RequestManager>>,
}

impl ModelRequest {
    /// Whether the caller asked for this request to stop.
    pub fn is_aborted(&self) -> bool {
        self.request_manager
            .as_ref()
            .is_some_and(|m| m.is_aborted(&self.request_id.0))
    }

    /// Forward a streamed chunk. Returns false when generation should stop.
    pub fn emit(&self, chunk: &str) -> bool {
        match &self.request_manager {
            Some(manager) => manager.on_chunk(chunk, &self.request_id.0),
            None => true,
        }
    }
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("chat_id", &self.chat_id)
            .field("conv_id", &self.conv_id)
            .field("new_conv", &self.new_conv)
            .field("request_id", &self.request_id)
            .field("request_manager", &self.request_manager.is_some())
            .finish()
    }
}

/// Keyed model output. The generated text lives under `predicted`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse(pub Map<String, Value>);

impl ModelResponse {
    pub fn predicted(text: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("predicted".into(), Value::String(text.into()));
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_predicted(mut self) -> Option<Value> {
        self.0.remove("predicted")
    }
}

/// Truthiness of a JSON value: `null`, `false`, zero, and empty strings,
/// arrays and objects are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Plain text rendering: strings without quotes, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
