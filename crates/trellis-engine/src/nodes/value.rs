use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{display_value, Result, TrellisError};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase};

/// Returns a constant.
pub struct ValueNode {
    base: NodeBase,
    value: Value,
}

impl ValueNode {
    pub(crate) fn new(base: NodeBase, value: Value) -> Self {
        Self { base, value }
    }
}

impl Node for ValueNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move { Ok(self.value.clone()) })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Value {
            value: self.value.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Value", display_value(&self.value))]
    }
}

/// Reads one context key.
pub struct ContextValueNode {
    base: NodeBase,
    key: String,
}

impl ContextValueNode {
    pub(crate) fn new(base: NodeBase, key: String) -> Self {
        Self { base, key }
    }
}

impl Node for ContextValueNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            ctx.get(&self.key)
                .ok_or_else(|| TrellisError::MissingKey(self.key.clone()))
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::ContextValue {
            key: self.key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Key", self.key.clone())]
    }
}
