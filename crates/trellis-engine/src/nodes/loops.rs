use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use trellis_core::{truthy, Result};

use crate::config::{NodeKind, NodeRef, Operand};
use crate::context::Context;
use crate::node::{Child, Node, NodeBase};
use crate::registry::NodeRegistry;

/// Repeats its body while the condition holds, up to `max_iter` times.
pub struct LoopNode {
    base: NodeBase,
    body: Child,
    cond: Option<Child>,
    max_iter: Option<usize>,
    limit: OnceLock<usize>,
}

impl LoopNode {
    pub(crate) fn new(
        base: NodeBase,
        body: NodeRef,
        cond: Option<Operand>,
        max_iter: Option<usize>,
    ) -> Self {
        Self {
            base,
            body: Child::new(body),
            cond: cond.map(Child::operand),
            max_iter,
            limit: OnceLock::new(),
        }
    }
}

impl Node for LoopNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.body.resolve(registry)?;
        if let Some(cond) = &self.cond {
            cond.resolve(registry)?;
        }
        let limit = self
            .max_iter
            .unwrap_or(registry.config().engine.max_iterations);
        let _ = self.limit.set(limit);
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let limit = self.limit.get().copied().unwrap_or_default();
            let body = self.body.get()?;
            let mut last = Value::Null;
            let mut iterations = 0;
            while iterations < limit && !self.base.is_stopped(ctx) {
                if let Some(cond) = &self.cond {
                    if !truthy(&cond.get()?.call(ctx).await?) || self.base.is_stopped(ctx) {
                        break;
                    }
                }
                last = body.call(ctx).await?;
                iterations += 1;
            }
            debug!(node = %self.base.name(), iterations, "loop finished");
            Ok(last)
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        std::iter::once(&self.body)
            .chain(self.cond.as_ref())
            .filter_map(|c| c.built().cloned())
            .collect()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Loop {
            body: self.body.to_node_ref()?,
            cond: self.cond.as_ref().map(Child::to_operand).transpose()?,
            max_iter: self.max_iter,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![("Body", self.body.label())];
        if let Some(cond) = &self.cond {
            lines.push(("Condition", cond.label()));
        }
        if let Some(max_iter) = self.max_iter {
            lines.push(("Max iterations", max_iter.to_string()));
        }
        lines
    }
}
