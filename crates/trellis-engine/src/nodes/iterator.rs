use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{Result, TrellisError};

use crate::config::{NodeKind, NodeRef, Operand};
use crate::context::Context;
use crate::node::{iter_items, Child, Node, NodeBase};
use crate::registry::NodeRegistry;
use crate::scope::join;

/// Body, iterable and item key shared by both iterator flavours.
struct Iteration {
    body: Child,
    iterable: Child,
    item_key: String,
}

impl Iteration {
    fn new(body: NodeRef, iterable: Operand, item_key: String) -> Self {
        Self {
            body: Child::new(body),
            iterable: Child::operand(iterable),
            item_key,
        }
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.body.resolve(registry)?;
        self.iterable.resolve(registry)?;
        Ok(())
    }

    async fn items(&self, ctx: &Context) -> Result<Vec<Value>> {
        iter_items(self.iterable.get()?.call(ctx).await?)
    }

    fn nested(&self) -> Vec<Arc<dyn Node>> {
        [&self.iterable, &self.body]
            .into_iter()
            .filter_map(|c| c.built().cloned())
            .collect()
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Iterable", self.iterable.label()),
            ("Item key", self.item_key.clone()),
            ("Body", self.body.label()),
        ]
    }
}

/// Runs the body once per item on the shared context and returns the last
/// result.
pub struct SequentialIteratorNode {
    base: NodeBase,
    iteration: Iteration,
}

impl SequentialIteratorNode {
    pub(crate) fn new(base: NodeBase, body: NodeRef, iterable: Operand, item_key: String) -> Self {
        Self {
            base,
            iteration: Iteration::new(body, iterable, item_key),
        }
    }
}

impl Node for SequentialIteratorNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.iteration.build(registry)
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let items = self.iteration.items(ctx).await?;
            let body = self.iteration.body.get()?;
            let mut last = Value::Null;
            for item in items {
                if self.base.is_stopped(ctx) {
                    break;
                }
                ctx.insert(self.iteration.item_key.clone(), item);
                last = body.call(ctx).await?;
            }
            Ok(last)
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        self.iteration.nested()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::SequentialIterator {
            body: self.iteration.body.to_node_ref()?,
            iterable: self.iteration.iterable.to_operand()?,
            item_key: self.iteration.item_key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        self.iteration.details()
    }
}

/// Runs the body for every item concurrently, each on a forked context.
///
/// The forks are merged back into the parent context in item order, and
/// the results are returned in item order.
pub struct ParallelIteratorNode {
    base: NodeBase,
    iteration: Iteration,
}

impl ParallelIteratorNode {
    pub(crate) fn new(base: NodeBase, body: NodeRef, iterable: Operand, item_key: String) -> Self {
        Self {
            base,
            iteration: Iteration::new(body, iterable, item_key),
        }
    }
}

impl Node for ParallelIteratorNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.iteration.build(registry)
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut items = self.iteration.items(ctx).await?;
            let body = self.iteration.body.get()?;
            let key = &self.iteration.item_key;
            if items.len() <= 1 {
                return match items.pop() {
                    None => Ok(Value::Array(Vec::new())),
                    Some(item) => {
                        ctx.insert(key.clone(), item);
                        Ok(Value::Array(vec![body.call(ctx).await?]))
                    }
                };
            }

            let scope = ctx
                .scope()
                .ok_or_else(|| TrellisError::NoExecution(self.base.name().to_string()))?;
            let handles: Vec<_> = items
                .into_iter()
                .map(|item| {
                    let sub = ctx.fork();
                    sub.insert(key.clone(), item);
                    body.spawn(&scope, sub)
                })
                .collect();

            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                let (sub, result) = join(handle).await?;
                ctx.merge(sub.snapshot());
                results.push(result);
            }
            Ok(Value::Array(results))
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        self.iteration.nested()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::ParallelIterator {
            body: self.iteration.body.to_node_ref()?,
            iterable: self.iteration.iterable.to_operand()?,
            item_key: self.iteration.item_key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        self.iteration.details()
    }
}
