use std::sync::OnceLock;

use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{Result, TrellisError};

use crate::config::{NodeFn, NodeKind};
use crate::context::Context;
use crate::node::{Node, NodeBase};
use crate::registry::NodeRegistry;

/// Calls a registered function with the context, or one of its values.
pub struct FunctionNode {
    base: NodeBase,
    func: String,
    source_key: Option<String>,
    resolved: OnceLock<NodeFn>,
}

impl FunctionNode {
    pub(crate) fn new(base: NodeBase, func: String, source_key: Option<String>) -> Self {
        Self {
            base,
            func,
            source_key,
            resolved: OnceLock::new(),
        }
    }
}

impl Node for FunctionNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        let func = registry.get_function(&self.func)?;
        let _ = self.resolved.set(func);
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let func = self
                .resolved
                .get()
                .ok_or_else(|| TrellisError::FunctionNotFound(self.func.clone()))?;
            let input = match &self.source_key {
                Some(key) => ctx
                    .get(key)
                    .ok_or_else(|| TrellisError::MissingKey(key.clone()))?,
                None => Value::Object(ctx.snapshot()),
            };
            func(input)
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Function {
            func: self.func.clone(),
            source_key: self.source_key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut lines = Vec::new();
        if let Some(key) = &self.source_key {
            lines.push(("Input key", key.clone()));
        }
        lines.push(("Function", self.func.clone()));
        lines
    }
}
