use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{Result, TrellisError};

use super::{build_all, built, labels};
use crate::config::{NodeKind, NodeRef};
use crate::context::Context;
use crate::node::{Child, Node, NodeBase};
use crate::registry::NodeRegistry;
use crate::scope::join;

/// Runs its children one after the other on the same context and returns
/// the last result.
pub struct SequentialNode {
    base: NodeBase,
    nodes: Vec<Child>,
}

impl SequentialNode {
    pub(crate) fn new(base: NodeBase, nodes: Vec<NodeRef>) -> Self {
        Self {
            base,
            nodes: nodes.into_iter().map(Child::new).collect(),
        }
    }
}

impl Node for SequentialNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        build_all(&self.nodes, registry)
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut last = Value::Null;
            for child in &self.nodes {
                if self.base.is_stopped(ctx) {
                    break;
                }
                last = child.get()?.call(ctx).await?;
            }
            Ok(last)
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        built(&self.nodes)
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn prefetch_target(&self) -> Option<Arc<dyn Node>> {
        self.nodes.first().and_then(Child::built).cloned()
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Sequential {
            nodes: self.nodes.iter().map(Child::to_node_ref).collect::<Result<_>>()?,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Nodes", labels(&self.nodes))]
    }
}

/// Runs its children concurrently on the scope's pool and returns their
/// results in declaration order.
pub struct ParallelNode {
    base: NodeBase,
    nodes: Vec<Child>,
}

impl ParallelNode {
    pub(crate) fn new(base: NodeBase, nodes: Vec<NodeRef>) -> Self {
        Self {
            base,
            nodes: nodes.into_iter().map(Child::new).collect(),
        }
    }
}

impl Node for ParallelNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        build_all(&self.nodes, registry)
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if let [only] = self.nodes.as_slice() {
                return Ok(Value::Array(vec![only.get()?.call(ctx).await?]));
            }
            let scope = ctx
                .scope()
                .ok_or_else(|| TrellisError::NoExecution(self.base.name().to_string()))?;
            let handles = self
                .nodes
                .iter()
                .map(|child| Ok(child.get()?.spawn(&scope, ctx.clone())))
                .collect::<Result<Vec<_>>>()?;

            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                let (_, result) = join(handle).await?;
                results.push(result);
            }
            Ok(Value::Array(results))
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        built(&self.nodes)
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Parallel {
            nodes: self.nodes.iter().map(Child::to_node_ref).collect::<Result<_>>()?,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Nodes", labels(&self.nodes))]
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{NodeConfig, NodeRef};
    use crate::context::Context;
    use crate::registry::NodeRegistry;
    use serde_json::{json, Value};

    fn value(registry: &NodeRegistry, name: &str, v: Value, key: &str) {
        registry
            .create(NodeConfig::value(v).named(name).with_output_key(key))
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequential_returns_last_and_shares_context() {
        let registry = NodeRegistry::default();
        value(&registry, "a", json!(1), "x");
        registry.register_function("double", |ctx: Value| Ok(json!(ctx["x"].as_i64().unwrap_or(0) * 2)));
        let seq = registry
            .create(NodeConfig::sequential([
                "a".into(),
                NodeConfig::function("double").with_output_key("y").into(),
            ]))
            .unwrap();
        let (ctx, result) = seq.start(Context::new()).await.unwrap();
        assert_eq!(result, json!(2));
        assert_eq!(ctx.get("x"), Some(json!(1)));
        assert_eq!(ctx.get("y"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_empty_sequential_is_null() {
        let registry = NodeRegistry::default();
        let seq = registry.create(NodeConfig::sequential(Vec::<NodeRef>::new())).unwrap();
        assert_eq!(seq.call(&Context::new()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_parallel_single_child_is_wrapped() {
        let registry = NodeRegistry::default();
        value(&registry, "a", json!("only"), "a");
        let par = registry.create(NodeConfig::parallel(["a".into()])).unwrap();
        assert_eq!(par.call(&Context::new()).await.unwrap(), json!(["only"]));
    }

    #[tokio::test]
    async fn test_parallel_keeps_declaration_order() {
        let registry = NodeRegistry::default();
        let nodes: Vec<NodeRef> = (0..5)
            .map(|i| NodeConfig::value(json!(i)).into())
            .collect();
        let par = registry.create(NodeConfig::parallel(nodes)).unwrap();
        assert_eq!(
            par.call(&Context::new()).await.unwrap(),
            json!([0, 1, 2, 3, 4])
        );
    }

    #[tokio::test]
    async fn test_child_error_propagates() {
        let registry = NodeRegistry::default();
        let seq = registry
            .create(NodeConfig::sequential([
                NodeConfig::context_value("missing").into(),
                NodeConfig::value(json!(1)).into(),
            ]))
            .unwrap();
        assert!(seq.call(&Context::new()).await.is_err());
    }

    #[test]
    fn test_config_keeps_names() {
        let registry = NodeRegistry::default();
        value(&registry, "a", json!(1), "x");
        let seq = registry
            .create(NodeConfig::sequential(["a".into()]).named("main"))
            .unwrap();
        assert_eq!(
            seq.config().unwrap().to_value().unwrap(),
            json!({"class_name": "SequentialExecution", "name": "main", "nodes": ["a"]})
        );
    }
}
