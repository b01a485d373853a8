use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use trellis_core::{truthy, Result, TrellisError};

use crate::config::{Branches, NodeKind};
use crate::context::Context;
use crate::node::{Child, Node, NodeBase};
use crate::registry::NodeRegistry;
use crate::scope::join;

/// Runs the branches whose key is truthy in the context.
///
/// Returns `{key: result}` for the active branches only, in declaration
/// order. Several active branches run concurrently.
pub struct DispatcherNode {
    base: NodeBase,
    branches: Vec<(String, Child)>,
}

impl DispatcherNode {
    pub(crate) fn new(base: NodeBase, branches: Branches) -> Self {
        Self {
            base,
            branches: branches
                .into_iter()
                .map(|(key, node)| (key, Child::new(node)))
                .collect(),
        }
    }

    fn active(&self, ctx: &Context) -> Vec<&(String, Child)> {
        self.branches
            .iter()
            .filter(|(key, _)| ctx.get(key).is_some_and(|v| truthy(&v)))
            .collect()
    }
}

impl Node for DispatcherNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        for (_, child) in &self.branches {
            child.resolve(registry)?;
        }
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let active = self.active(ctx);
            let mut results = Map::new();
            match active.as_slice() {
                [] => {}
                [(key, child)] => {
                    results.insert(key.clone(), child.get()?.call(ctx).await?);
                }
                many => {
                    let scope = ctx
                        .scope()
                        .ok_or_else(|| TrellisError::NoExecution(self.base.name().to_string()))?;
                    let mut handles = Vec::with_capacity(many.len());
                    for (key, child) in many {
                        handles.push((key, child.get()?.spawn(&scope, ctx.clone())));
                    }
                    for (key, handle) in handles {
                        let (_, result) = join(handle).await?;
                        results.insert(key.clone(), result);
                    }
                }
            }
            Ok(Value::Object(results))
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        self.branches
            .iter()
            .filter_map(|(_, child)| child.built().cloned())
            .collect()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Dispatcher {
            branches: self
                .branches
                .iter()
                .map(|(key, child)| Ok((key.clone(), child.to_node_ref()?)))
                .collect::<Result<_>>()?,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        self.branches
            .iter()
            .map(|(key, child)| ("Branch", format!("{key} -> {}", child.label())))
            .collect()
    }
}
