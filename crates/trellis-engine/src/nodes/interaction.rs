use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{display_value, Result, TrellisError};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase};

/// Writes a context value to stdout.
pub struct PrintNode {
    base: NodeBase,
    key: String,
}

impl PrintNode {
    pub(crate) fn new(base: NodeBase, key: String) -> Self {
        Self { base, key }
    }
}

impl Node for PrintNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let value = ctx
                .get(&self.key)
                .ok_or_else(|| TrellisError::MissingKey(self.key.clone()))?;
            println!("{}", display_value(&value));
            Ok(Value::Null)
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Print {
            key: self.key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Key", self.key.clone())]
    }
}

/// Reads one line from the terminal.
pub struct CliNode {
    base: NodeBase,
    prompt: String,
}

impl CliNode {
    pub(crate) fn new(base: NodeBase, prompt: String) -> Self {
        Self { base, prompt }
    }
}

impl Node for CliNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        let prompt = self.prompt.clone();
        Box::pin(async move {
            let line = tokio::task::spawn_blocking(move || {
                dialoguer::Input::<String>::new()
                    .with_prompt(prompt)
                    .allow_empty(true)
                    .interact_text()
            })
            .await
            .map_err(|e| TrellisError::Task(e.to_string()))?
            .map_err(|e| TrellisError::Input(e.to_string()))?;
            Ok(Value::String(line))
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Cli {
            prompt: self.prompt.clone(),
        })
    }
}
