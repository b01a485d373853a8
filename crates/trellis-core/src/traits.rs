use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{ModelRequest, ModelResponse};

/// Text-generation model consumed by LLM nodes.
pub trait LanguageModel: Send + Sync + 'static {
    /// Registry name of the model.
    fn name(&self) -> &str;

    /// Run `method` (e.g. `"answer"`) with the given request.
    fn invoke(&self, method: &str, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// Streaming coordinator shared between a caller and a model.
pub trait RequestManager: Send + Sync {
    /// Whether generation for `request_id` should stop.
    fn is_aborted(&self, request_id: &str) -> bool;

    /// Receive one generated chunk. Returning false asks the model to stop.
    fn on_chunk(&self, chunk: &str, request_id: &str) -> bool {
        let _ = chunk;
        !self.is_aborted(request_id)
    }
}

/// A named callable exposed to sandboxed code.
pub trait Tool: Send + Sync + 'static {
    /// Name the tool is bound to inside the sandbox.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Declared keyword parameters, in positional order.
    fn parameters(&self) -> &[String];

    /// Whether the tool takes arbitrary keyword arguments.
    fn accepts_any(&self) -> bool {
        false
    }

    /// Execute with positional and keyword arguments.
    fn invoke(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value>;

    /// Prompt-ready signature, e.g. `def search(query, n):` followed by the description.
    fn signature(&self) -> String {
        let mut params = self.parameters().to_vec();
        if self.accepts_any() {
            params.push("**kwargs".into());
        }
        format!(
            "def {}({}):\n    \"\"\"{}\"\"\"",
            self.name(),
            params.join(", "),
            self.description()
        )
    }
}
