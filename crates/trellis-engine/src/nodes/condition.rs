use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use trellis_core::{truthy, Result};

use crate::config::{branch_key, Branches, NodeKind, NodeRef, Operand};
use crate::context::Context;
use crate::node::{Child, Node, NodeBase};
use crate::registry::NodeRegistry;

/// If / else on a predicate node or context key.
pub struct ConditionNode {
    base: NodeBase,
    condition: Child,
    true_node: Child,
    false_node: Option<Child>,
}

impl ConditionNode {
    pub(crate) fn new(
        base: NodeBase,
        condition: Operand,
        true_node: NodeRef,
        false_node: Option<NodeRef>,
    ) -> Self {
        Self {
            base,
            condition: Child::operand(condition),
            true_node: Child::new(true_node),
            false_node: false_node.map(Child::new),
        }
    }
}

impl Node for ConditionNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.condition.resolve(registry)?;
        self.true_node.resolve(registry)?;
        if let Some(false_node) = &self.false_node {
            false_node.resolve(registry)?;
        }
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let value = self.condition.get()?.call(ctx).await?;
            if self.base.is_stopped(ctx) {
                return Ok(Value::Null);
            }
            let branch = if truthy(&value) {
                Some(&self.true_node)
            } else {
                self.false_node.as_ref()
            };
            match branch {
                Some(child) => child.get()?.call(ctx).await,
                None => Ok(Value::Null),
            }
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        [Some(&self.condition), Some(&self.true_node), self.false_node.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|c| c.built().cloned())
            .collect()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Condition {
            condition: self.condition.to_operand()?,
            true_node: self.true_node.to_node_ref()?,
            false_node: self
                .false_node
                .as_ref()
                .map(Child::to_node_ref)
                .transpose()?,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![
            ("Condition", self.condition.label()),
            ("True", self.true_node.label()),
        ];
        if let Some(false_node) = &self.false_node {
            lines.push(("False", false_node.label()));
        }
        lines
    }
}

/// Dispatches on the predicate's value, falling back to a `"default"` branch.
pub struct BranchingNode {
    base: NodeBase,
    condition: Child,
    branches: Vec<(String, Child)>,
}

impl BranchingNode {
    pub(crate) fn new(base: NodeBase, condition: Operand, branches: Branches) -> Self {
        Self {
            base,
            condition: Child::operand(condition),
            branches: branches
                .into_iter()
                .map(|(key, node)| (key, Child::new(node)))
                .collect(),
        }
    }

    fn branch(&self, key: &str) -> Option<&Child> {
        let find = |wanted: &str| {
            self.branches
                .iter()
                .find(|(k, _)| k == wanted)
                .map(|(_, child)| child)
        };
        find(key).or_else(|| find("default"))
    }
}

impl Node for BranchingNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.condition.resolve(registry)?;
        for (_, child) in &self.branches {
            child.resolve(registry)?;
        }
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let value = self.condition.get()?.call(ctx).await?;
            if self.base.is_stopped(ctx) {
                return Ok(Value::Null);
            }
            match self.branch(&branch_key(&value)) {
                Some(child) => child.get()?.call(ctx).await,
                None => Ok(Value::Null),
            }
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        std::iter::once(&self.condition)
            .chain(self.branches.iter().map(|(_, child)| child))
            .filter_map(|c| c.built().cloned())
            .collect()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Branching {
            condition: self.condition.to_operand()?,
            branches: self
                .branches
                .iter()
                .map(|(key, child)| Ok((key.clone(), child.to_node_ref()?)))
                .collect::<Result<_>>()?,
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        std::iter::once(("Condition", self.condition.label()))
            .chain(
                self.branches
                    .iter()
                    .map(|(key, child)| ("Branch", format!("{key} -> {}", child.label()))),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::context::Context;
    use crate::registry::NodeRegistry;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_condition_on_context_key() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::condition(
                "flag",
                NodeConfig::value(json!("yes")),
                Some(NodeConfig::value(json!("no")).into()),
            ))
            .unwrap();
        let ctx = Context::new();
        ctx.insert("flag", json!(true));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("yes"));
        ctx.insert("flag", json!(""));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("no"));
    }

    #[tokio::test]
    async fn test_condition_without_false_branch() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::condition(
                json!(false),
                NodeConfig::value(json!("yes")),
                None,
            ))
            .unwrap();
        assert_eq!(node.call(&Context::new()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_branching_matches_and_falls_back() {
        let registry = NodeRegistry::default();
        let node = registry
            .load_workflow(
                r#"{"class_name": "BranchingNode", "condition": "mode", "branches": [
                    ["fast", {"class_name": "ValueNode", "value": "F"}],
                    [2, {"class_name": "ValueNode", "value": "two"}],
                    ["default", {"class_name": "ValueNode", "value": "D"}]
                ]}"#,
            )
            .unwrap();
        let ctx = Context::new();
        ctx.insert("mode", json!("fast"));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("F"));
        ctx.insert("mode", json!(2));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("two"));
        ctx.insert("mode", json!("other"));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("D"));
    }

    #[tokio::test]
    async fn test_branching_without_default_is_null() {
        let registry = NodeRegistry::default();
        let node = registry
            .load_workflow(
                r#"{"class_name": "BranchingNode", "condition": "mode",
                    "branches": {"a": {"class_name": "ValueNode", "value": 1}}}"#,
            )
            .unwrap();
        let ctx = Context::new();
        ctx.insert("mode", json!("b"));
        assert_eq!(node.call(&ctx).await.unwrap(), Value::Null);
    }
}
