use std::sync::OnceLock;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;
use trellis_core::{display_value, Result, TrellisError};
use trellis_sandbox::{extract_code, strip_simulated_output, CodeSandbox};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase};
use crate::registry::NodeRegistry;

pub(crate) struct CodeSettings {
    pub source_key: String,
    pub tools: Vec<String>,
    pub tool_kwargs: Map<String, Value>,
    pub inputs: Vec<String>,
    pub format: bool,
}

/// Runs the code found in a model answer inside the sandbox.
///
/// Fenced `python` blocks are executed when present, the whole text
/// otherwise. Returns `{variables, stdout, stderr}`, or its rendered form
/// when `format` is set.
pub struct CodeNode {
    base: NodeBase,
    settings: CodeSettings,
    sandbox: OnceLock<CodeSandbox>,
}

impl CodeNode {
    pub(crate) fn new(base: NodeBase, settings: CodeSettings) -> Self {
        Self {
            base,
            settings,
            sandbox: OnceLock::new(),
        }
    }

    fn globals(&self, ctx: &Context) -> Map<String, Value> {
        self.settings
            .inputs
            .iter()
            .filter_map(|key| ctx.get(key).map(|v| (key.clone(), v)))
            .collect()
    }
}

fn runnable_code(text: &str) -> String {
    let (_, blocks) = extract_code(text);
    let code = if blocks.is_empty() {
        text.to_string()
    } else {
        blocks.join("\n\n")
    };
    strip_simulated_output(&code)
}

impl Node for CodeNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        let tools = self
            .settings
            .tools
            .iter()
            .map(|name| registry.tool(name))
            .collect::<Result<Vec<_>>>()?;
        let sandbox = CodeSandbox::new(registry.config().sandbox.clone())
            .with_tools(tools)
            .with_tool_kwargs(self.settings.tool_kwargs.clone());
        let _ = self.sandbox.set(sandbox);
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let key = &self.settings.source_key;
            let text = ctx
                .get(key)
                .map(|v| display_value(&v))
                .ok_or_else(|| TrellisError::MissingKey(key.clone()))?;
            let sandbox = self
                .sandbox
                .get()
                .ok_or_else(|| TrellisError::Task("sandbox not initialised".into()))?
                .clone()
                .with_globals(self.globals(ctx));
            let code = runnable_code(&text);
            debug!(node = %self.base.name(), lines = code.lines().count(), "executing snippet");

            let result = tokio::task::spawn_blocking(move || sandbox.execute(&code))
                .await
                .map_err(|e| TrellisError::Task(e.to_string()))?;
            if self.settings.format {
                Ok(Value::String(result.format()))
            } else {
                Ok(serde_json::to_value(result)?)
            }
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Code {
            source_key: self.settings.source_key.clone(),
            tools: self.settings.tools.clone(),
            tool_kwargs: self.settings.tool_kwargs.clone(),
            inputs: self.settings.inputs.clone(),
            format: self.settings.format,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![("Input key", self.settings.source_key.clone())];
        if !self.settings.tools.is_empty() {
            lines.push(("Tools", self.settings.tools.join(", ")));
        }
        lines
    }
}
