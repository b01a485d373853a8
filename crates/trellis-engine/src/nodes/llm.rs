use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;
use trellis_core::{LanguageModel, ModelRequest, RequestId, RequestManager, Result, TrellisError};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase, StopFlags};
use crate::registry::NodeRegistry;

/// Lets a streaming model see the node's stop state.
struct StopManager {
    flags: Arc<StopFlags>,
    ctx: Context,
}

impl RequestManager for StopManager {
    fn is_aborted(&self, _request_id: &str) -> bool {
        self.flags.is_set() || self.ctx.is_stopped()
    }
}

/// Calls a registered language model.
///
/// With a `source_key`, an object under that key is merged into the keyword
/// arguments and any other value becomes the single positional argument
/// (plus `mapping`'d context values). Without one, the whole context is
/// passed as keyword arguments.
pub struct LlmNode {
    base: NodeBase,
    model: String,
    method: String,
    mapping: Option<BTreeMap<String, String>>,
    source_key: Option<String>,
    keep_history: bool,
    kwargs: Map<String, Value>,
    resolved: OnceLock<Arc<dyn LanguageModel>>,
}

pub(crate) struct LlmSettings {
    pub model: String,
    pub method: String,
    pub mapping: Option<BTreeMap<String, String>>,
    pub source_key: Option<String>,
    pub keep_history: bool,
    pub kwargs: Map<String, Value>,
}

impl LlmNode {
    pub(crate) fn new(base: NodeBase, settings: LlmSettings) -> Self {
        Self {
            base,
            model: settings.model,
            method: settings.method,
            mapping: settings.mapping,
            source_key: settings.source_key,
            keep_history: settings.keep_history,
            kwargs: settings.kwargs,
            resolved: OnceLock::new(),
        }
    }

    fn arguments(&self, ctx: &Context) -> Result<(Vec<Value>, Map<String, Value>)> {
        let mut kwargs = self.kwargs.clone();
        let Some(key) = &self.source_key else {
            kwargs.extend(ctx.snapshot());
            return Ok((Vec::new(), kwargs));
        };
        match ctx.get(key) {
            Some(Value::Object(fields)) => {
                kwargs.extend(fields);
                Ok((Vec::new(), kwargs))
            }
            Some(value) => {
                for (kwarg, ctx_key) in self.mapping.iter().flatten() {
                    if let Some(v) = ctx.get(ctx_key) {
                        kwargs.insert(kwarg.clone(), v);
                    }
                }
                Ok((vec![value], kwargs))
            }
            None => Err(TrellisError::MissingKey(key.clone())),
        }
    }
}

impl Node for LlmNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        let model = registry.model(&self.model)?;
        let _ = self.resolved.set(model);
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let model = self
                .resolved
                .get()
                .ok_or_else(|| TrellisError::ModelNotFound(self.model.clone()))?;
            let (args, kwargs) = self.arguments(ctx)?;
            let chat_id = ctx
                .scope()
                .map(|scope| scope.root().to_string())
                .unwrap_or_else(|| self.base.name().to_string());
            let request = ModelRequest {
                args,
                kwargs,
                chat_id,
                conv_id: self.keep_history.then(|| self.base.name().to_string()),
                new_conv: !self.keep_history,
                request_id: RequestId::new(),
                request_manager: Some(Arc::new(StopManager {
                    flags: Arc::clone(self.base.flags()),
                    ctx: ctx.clone(),
                })),
            };
            debug!(
                node = %self.base.name(),
                model = %self.model,
                method = %self.method,
                request_id = %request.request_id,
                "invoking model"
            );
            let response = model.invoke(&self.method, request).await?;
            response.into_predicted().ok_or_else(|| {
                TrellisError::Model(format!(
                    "{} returned no `predicted` field for {}",
                    self.model, self.method
                ))
            })
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Llm {
            model: self.model.clone(),
            method: self.method.clone(),
            mapping: self.mapping.clone(),
            source_key: self.source_key.clone(),
            keep_history: self.keep_history,
            kwargs: self.kwargs.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut lines = Vec::new();
        if let Some(key) = &self.source_key {
            lines.push(("Input key", key.clone()));
        }
        lines.push(("Model", format!("{} ({})", self.model, self.method)));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use serde_json::json;
    use std::sync::Mutex;
    use trellis_core::ModelResponse;

    /// Echoes its request back in the response.
    struct Echo {
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl LanguageModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn invoke(&self, method: &str, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
            let method = method.to_string();
            Box::pin(async move {
                let text = format!("{method}:{}", request.args.len());
                self.seen.lock().unwrap().push(request);
                Ok(ModelResponse::predicted(text))
            })
        }
    }

    fn setup() -> (NodeRegistry, Arc<Echo>) {
        let registry = NodeRegistry::default();
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        registry.register_model(echo.clone());
        (registry, echo)
    }

    #[tokio::test]
    async fn test_positional_input_with_mapping() {
        let (registry, echo) = setup();
        let node = registry
            .load_workflow(
                r#"{"class_name": "LLMNode", "name": "ask", "model": "echo",
                    "source_key": "question", "mapping": {"lang": "language"},
                    "kwargs": {"temperature": 0.5}}"#,
            )
            .unwrap();
        let ctx = Context::new();
        ctx.insert("question", json!("why?"));
        ctx.insert("language", json!("fr"));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("answer:1"));

        let seen = echo.seen.lock().unwrap();
        let request = &seen[0];
        assert_eq!(request.args, vec![json!("why?")]);
        assert_eq!(request.kwargs.get("lang"), Some(&json!("fr")));
        assert_eq!(request.kwargs.get("temperature"), Some(&json!(0.5)));
        assert_eq!(request.chat_id, "ask");
        assert_eq!(request.conv_id.as_deref(), Some("ask"));
        assert!(!request.new_conv);
        assert!(!request.is_aborted());
    }

    #[tokio::test]
    async fn test_object_input_and_no_history() {
        let (registry, echo) = setup();
        let node = registry
            .create(NodeConfig::new(NodeKind::Llm {
                model: "echo".into(),
                method: "chat".into(),
                mapping: None,
                source_key: Some("req".into()),
                keep_history: false,
                kwargs: Map::new(),
            }))
            .unwrap();
        let ctx = Context::new();
        ctx.insert("req", json!({"text": "hi", "max_tokens": 4}));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("chat:0"));

        let seen = echo.seen.lock().unwrap();
        assert!(seen[0].args.is_empty());
        assert_eq!(seen[0].kwargs.get("text"), Some(&json!("hi")));
        assert_eq!(seen[0].conv_id, None);
        assert!(seen[0].new_conv);
    }

    #[tokio::test]
    async fn test_context_as_kwargs() {
        let (registry, echo) = setup();
        let node = registry
            .load_workflow(r#"{"class_name": "LLMNode", "model": "echo"}"#)
            .unwrap();
        let ctx = Context::new();
        ctx.insert("topic", json!("rust"));
        node.call(&ctx).await.unwrap();
        assert_eq!(
            echo.seen.lock().unwrap()[0].kwargs.get("topic"),
            Some(&json!("rust"))
        );
    }

    #[tokio::test]
    async fn test_unknown_model_fails_build() {
        let registry = NodeRegistry::default();
        let node = registry
            .load_workflow(r#"{"class_name": "LLMNode", "model": "nope"}"#)
            .unwrap();
        let err = node.call(&Context::new()).await.unwrap_err();
        assert!(matches!(err, TrellisError::Build { ref message, .. } if message.contains("nope")));
    }

    #[test]
    fn test_stop_manager_follows_flags() {
        let ctx = Context::new();
        let manager = StopManager {
            flags: Arc::new(StopFlags::default()),
            ctx: ctx.clone(),
        };
        assert!(manager.on_chunk("a", "r"));
        ctx.abort();
        assert!(manager.is_aborted("r"));
        assert!(!manager.on_chunk("b", "r"));
    }
}
