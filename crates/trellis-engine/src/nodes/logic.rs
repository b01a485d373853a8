use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_core::{truthy, Result, TrellisError};

use crate::config::{NodeKind, NodeRef, Operand};
use crate::context::Context;
use crate::node::{iter_items, Child, Node, NodeBase};
use crate::registry::NodeRegistry;

/// Logical OR over an iterable: true as soon as the body returns a truthy
/// value for one item.
///
/// Items race on the pool, each on a forked context bound to `item_key`.
/// The winner cancels the others. Bodies still queued then start as pool
/// tasks, see the cancelled token and report no result without running.
/// A failing body counts as false.
pub struct AnyNode {
    base: NodeBase,
    body: Child,
    iterable: Child,
    item_key: String,
}

impl AnyNode {
    pub(crate) fn new(base: NodeBase, body: NodeRef, iterable: Operand, item_key: String) -> Self {
        Self {
            base,
            body: Child::new(body),
            iterable: Child::operand(iterable),
            item_key,
        }
    }

    async fn race(&self, ctx: &Context, body: &Arc<dyn Node>, items: Vec<Value>) -> Result<bool> {
        let scope = ctx
            .scope()
            .ok_or_else(|| TrellisError::NoExecution(self.base.name().to_string()))?;
        let token = ctx
            .stopper()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let _stop_on_exit = token.clone().drop_guard();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for item in items {
            let sub = ctx.fork().with_stopper(token.clone());
            sub.insert(self.item_key.clone(), item);
            let body = Arc::clone(body);
            let token = token.clone();
            let tx = tx.clone();
            scope.pool().submit(async move {
                if token.is_cancelled() {
                    let _ = tx.send(None);
                    return;
                }
                let _ = tx.send(Some(body.call(&sub).await));
            });
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            match outcome {
                Some(Ok(value)) if truthy(&value) => {
                    debug!(node = %self.base.name(), "race decided");
                    token.cancel();
                    return Ok(true);
                }
                Some(Err(e)) => {
                    warn!(node = %self.base.name(), error = %e, "race branch failed");
                }
                _ => {}
            }
        }
        Ok(false)
    }
}

impl Node for AnyNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        self.body.resolve(registry)?;
        self.iterable.resolve(registry)?;
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let items = iter_items(self.iterable.get()?.call(ctx).await?)?;
            let body = self.body.get()?;
            let found = match items.len() {
                0 => false,
                1 => {
                    let item = items.into_iter().next().unwrap_or_default();
                    ctx.insert(self.item_key.clone(), item);
                    match body.call(ctx).await {
                        Ok(value) => truthy(&value),
                        Err(e) => {
                            warn!(node = %self.base.name(), error = %e, "race branch failed");
                            false
                        }
                    }
                }
                _ => self.race(ctx, body, items).await?,
            };
            Ok(Value::Bool(found))
        })
    }

    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        [&self.iterable, &self.body]
            .into_iter()
            .filter_map(|c| c.built().cloned())
            .collect()
    }

    fn is_atomic(&self) -> bool {
        false
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Any {
            body: self.body.to_node_ref()?,
            iterable: self.iterable.to_operand()?,
            item_key: self.item_key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Iterable", self.iterable.label()),
            ("Item key", self.item_key.clone()),
            ("Body", self.body.label()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::context::Context;
    use crate::registry::NodeRegistry;
    use serde_json::{json, Value};
    use trellis_core::TrellisError;

    fn is_even(registry: &NodeRegistry) {
        registry.register_function("is_even", |ctx: Value| match ctx["n"].as_i64() {
            Some(n) => Ok(json!(n % 2 == 0)),
            None => Err(TrellisError::Type("n is not an integer".into())),
        });
    }

    #[tokio::test]
    async fn test_any_finds_a_match() {
        let registry = NodeRegistry::default();
        is_even(&registry);
        let node = registry
            .create(NodeConfig::any(NodeConfig::function("is_even"), json!([1, 3, 4]), "n"))
            .unwrap();
        assert_eq!(node.call(&Context::new()).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_any_without_match_and_empty() {
        let registry = NodeRegistry::default();
        is_even(&registry);
        let odd = registry
            .create(NodeConfig::any(NodeConfig::function("is_even"), json!([1, 3]), "n"))
            .unwrap();
        assert_eq!(odd.call(&Context::new()).await.unwrap(), json!(false));

        let empty = registry
            .create(NodeConfig::any(NodeConfig::function("is_even"), json!([]), "n"))
            .unwrap();
        assert_eq!(empty.call(&Context::new()).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_failing_bodies_are_falsy() {
        let registry = NodeRegistry::default();
        is_even(&registry);
        let node = registry
            .create(NodeConfig::any(NodeConfig::function("is_even"), json!(["x", "y"]), "n"))
            .unwrap();
        assert_eq!(node.call(&Context::new()).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_single_item_binds_on_shared_context() {
        let registry = NodeRegistry::default();
        is_even(&registry);
        let node = registry
            .create(NodeConfig::any(NodeConfig::function("is_even"), "numbers", "n"))
            .unwrap();
        let ctx = Context::new();
        ctx.insert("numbers", json!([2]));
        assert_eq!(node.call(&ctx).await.unwrap(), json!(true));
        assert_eq!(ctx.get("n"), Some(json!(2)));
    }
}
