use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use trellis_core::{Result, TrellisError};

use crate::config::{NodeConfig, NodeKind, NodeRef, Operand};
use crate::context::Context;
use crate::registry::{NodeRegistry, RegistryInner};
use crate::scope::{join, ExecutionScope, ScopeGuard};

/// A unit of work in a workflow graph.
///
/// Implementors provide [`Node::run`] and, for nodes with children,
/// [`Node::build`] and [`Node::nested_nodes`]. The execution protocol
/// (building, prefetching, output binding, stop handling) lives on
/// `dyn Node` and is shared by every node type.
pub trait Node: Send + Sync + 'static {
    fn base(&self) -> &NodeBase;

    /// The node's core logic.
    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>>;

    /// Resolve declarative children. Called at most once.
    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        let _ = registry;
        Ok(())
    }

    /// Built children, used for abort and cancel propagation.
    fn nested_nodes(&self) -> Vec<Arc<dyn Node>> {
        Vec::new()
    }

    /// Atomic nodes hold a worker permit while running and may be prefetched.
    fn is_atomic(&self) -> bool {
        true
    }

    /// Child a composite node forwards `prefetch` to.
    fn prefetch_target(&self) -> Option<Arc<dyn Node>> {
        None
    }

    /// Class-specific declarative fields.
    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Custom {
            class_name: self.base().class_name().to_string(),
            fields: Map::new(),
        })
    }

    /// Extra `(label, value)` lines for [`describe`](trait.Node.html#method.describe).
    fn details(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Stop signals of one node instance.
#[derive(Debug, Default)]
pub struct StopFlags {
    aborted: AtomicBool,
    cancelled: AtomicBool,
}

impl StopFlags {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.is_aborted() || self.is_cancelled()
    }
}

enum BuildState {
    Unbuilt,
    Built,
    Failed(String),
}

struct PrefetchLinks {
    start: Vec<Arc<dyn Node>>,
    stop: Vec<Arc<dyn Node>>,
}

struct Prefetch {
    scope: String,
    handle: JoinHandle<Result<Value>>,
}

/// State every node carries: identity, build state, stop flags and the
/// pending prefetch slot.
pub struct NodeBase {
    name: String,
    class_name: String,
    output_key: Option<String>,
    start_prefetch: Vec<String>,
    stop_prefetch: Vec<String>,
    registry: Weak<RegistryInner>,
    state: Mutex<BuildState>,
    links: OnceLock<PrefetchLinks>,
    flags: Arc<StopFlags>,
    prefetched: Mutex<Option<Prefetch>>,
    settling: tokio::sync::Mutex<()>,
}

impl NodeBase {
    pub(crate) fn new(name: String, class_name: &str, registry: Weak<RegistryInner>) -> Self {
        Self {
            name,
            class_name: class_name.to_string(),
            output_key: None,
            start_prefetch: Vec::new(),
            stop_prefetch: Vec::new(),
            registry,
            state: Mutex::new(BuildState::Unbuilt),
            links: OnceLock::new(),
            flags: Arc::new(StopFlags::default()),
            prefetched: Mutex::new(None),
            settling: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_output_key(mut self, key: Option<String>) -> Self {
        self.output_key = key;
        self
    }

    pub fn with_prefetch(mut self, start: Vec<String>, stop: Vec<String>) -> Self {
        self.start_prefetch = start;
        self.stop_prefetch = stop;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub fn start_prefetch(&self) -> &[String] {
        &self.start_prefetch
    }

    pub fn stop_prefetch(&self) -> &[String] {
        &self.stop_prefetch
    }

    pub fn registry(&self) -> Result<NodeRegistry> {
        NodeRegistry::upgrade(&self.registry)
            .ok_or_else(|| TrellisError::Detached(self.name.clone()))
    }

    pub fn flags(&self) -> &Arc<StopFlags> {
        &self.flags
    }

    pub fn is_built(&self) -> bool {
        matches!(*self.state.lock().unwrap(), BuildState::Built)
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.is_aborted()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.is_cancelled()
    }

    /// Whether running work should wind down.
    pub fn is_stopped(&self, ctx: &Context) -> bool {
        self.flags.is_set() || ctx.is_stopped()
    }

    pub fn is_prefetched(&self) -> bool {
        self.prefetched.lock().unwrap().is_some()
    }

    fn workers(&self) -> usize {
        self.registry()
            .map(|r| r.config().engine.worker_count())
            .unwrap_or_else(|_| trellis_core::config::EngineConfig::default().worker_count())
    }

    fn resolve_links(&self, registry: &NodeRegistry) -> Result<()> {
        if self.links.get().is_some() {
            return Ok(());
        }
        let lookup = |names: &[String]| -> Result<Vec<Arc<dyn Node>>> {
            names.iter().map(|n| registry.get(n)).collect()
        };
        let links = PrefetchLinks {
            start: lookup(&self.start_prefetch)?,
            stop: lookup(&self.stop_prefetch)?,
        };
        let _ = self.links.set(links);
        Ok(())
    }

    /// Take the pending prefetch if it belongs to `scope`. A stale one is dropped.
    fn take_prefetch(&self, scope: &str) -> Option<JoinHandle<Result<Value>>> {
        let pending = self.prefetched.lock().unwrap().take()?;
        if pending.scope == scope {
            Some(pending.handle)
        } else {
            debug!(node = %self.name, "dropping prefetch from a finished execution");
            pending.handle.abort();
            None
        }
    }
}

/// A child slot: its declaration and, once built, the resolved node.
pub struct Child {
    decl: Operand,
    node: OnceLock<Arc<dyn Node>>,
}

impl Child {
    pub fn new(node: impl Into<NodeRef>) -> Self {
        Self::operand(Operand::Node(node.into()))
    }

    /// Context keys become context-value nodes, literals value nodes.
    pub fn operand(decl: Operand) -> Self {
        Self {
            decl,
            node: OnceLock::new(),
        }
    }

    pub fn resolve(&self, registry: &NodeRegistry) -> Result<&Arc<dyn Node>> {
        if let Some(node) = self.node.get() {
            return Ok(node);
        }
        let node = match &self.decl {
            Operand::Key(key) => registry.create(NodeConfig::context_value(key.clone()))?,
            Operand::Literal(value) => registry.create(NodeConfig::value(value.clone()))?,
            Operand::Node(node) => registry.resolve(node)?,
        };
        Ok(self.node.get_or_init(|| node))
    }

    pub fn get(&self) -> Result<&Arc<dyn Node>> {
        self.node.get().ok_or_else(|| TrellisError::Build {
            node: self.label(),
            message: "child used before its parent was built".into(),
        })
    }

    pub fn built(&self) -> Option<&Arc<dyn Node>> {
        self.node.get()
    }

    /// Declarative form, keeping name references as names.
    pub fn to_operand(&self) -> Result<Operand> {
        match &self.decl {
            Operand::Node(decl) => Ok(Operand::Node(self.reference(decl)?)),
            other => Ok(other.clone()),
        }
    }

    pub fn to_node_ref(&self) -> Result<NodeRef> {
        match &self.decl {
            Operand::Node(decl) => self.reference(decl),
            Operand::Key(key) => Ok(NodeConfig::context_value(key.clone()).into()),
            Operand::Literal(value) => Ok(NodeConfig::value(value.clone()).into()),
        }
    }

    fn reference(&self, decl: &NodeRef) -> Result<NodeRef> {
        match (decl, self.node.get()) {
            (NodeRef::Name(name), _) => Ok(NodeRef::Name(name.clone())),
            (_, Some(node)) => Ok(node.config()?.into()),
            (decl, None) => Ok(decl.clone()),
        }
    }

    pub fn label(&self) -> String {
        match (&self.decl, self.node.get()) {
            (_, Some(node)) => node.name().to_string(),
            (Operand::Key(key), None) => format!("context[{key}]"),
            (Operand::Literal(value), None) => value.to_string(),
            (Operand::Node(NodeRef::Name(name)), None) => name.clone(),
            (Operand::Node(NodeRef::Config(config)), None) => config.class_name().to_string(),
            (Operand::Node(NodeRef::Node(node)), None) => node.name().to_string(),
            (Operand::Node(NodeRef::Func(_)), None) => "<closure>".into(),
        }
    }
}

impl dyn Node {
    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn class_name(&self) -> &str {
        self.base().class_name()
    }

    pub fn output_key(&self) -> Option<&str> {
        self.base().output_key()
    }

    pub fn is_stopped(&self, ctx: &Context) -> bool {
        self.base().is_stopped(ctx)
    }

    /// Run [`Node::build`] once. A failure is remembered and returned again.
    pub fn ensure_built(&self) -> Result<()> {
        let base = self.base();
        let mut state = base.state.lock().unwrap();
        match &*state {
            BuildState::Built => return Ok(()),
            BuildState::Failed(message) => {
                return Err(TrellisError::Build {
                    node: base.name.clone(),
                    message: message.clone(),
                })
            }
            BuildState::Unbuilt => {}
        }
        let outcome = base.registry().and_then(|registry| {
            base.resolve_links(&registry)?;
            self.build(&registry)
        });
        match outcome {
            Ok(()) => {
                debug!(node = %base.name, class = %base.class_name, "node built");
                *state = BuildState::Built;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!(node = %base.name, error = %message, "node build failed");
                *state = BuildState::Failed(message.clone());
                Err(TrellisError::Build {
                    node: base.name.clone(),
                    message,
                })
            }
        }
    }

    /// Execute the node on `ctx` and return the context with the result.
    ///
    /// The first `start` of an invocation opens the execution scope and
    /// releases it when it returns.
    pub fn start(self: &Arc<Self>, ctx: Context) -> BoxFuture<'static, Result<(Context, Value)>> {
        let node = Arc::clone(self);
        Box::pin(async move {
            let guard: Option<ScopeGuard> = match ctx.scope() {
                Some(_) => None,
                None => Some(ExecutionScope::open(&ctx, node.name(), node.base().workers())),
            };
            node.ensure_built()?;

            if ctx.is_aborted() || node.base().is_aborted() {
                warn!(node = %node.name(), "workflow stopped, skipping node");
                return Ok((ctx, Value::Null));
            }

            debug!(node = %node.name(), root = guard.is_some(), "starting node");
            node.on_start(&ctx);

            let pending = ctx
                .scope()
                .and_then(|scope| node.base().take_prefetch(scope.id()));
            let result = match pending {
                Some(handle) => {
                    debug!(node = %node.name(), "using prefetched result");
                    join(handle).await?
                }
                None if node.is_atomic() => {
                    let scope = ctx
                        .scope()
                        .ok_or_else(|| TrellisError::NoExecution(node.name().to_string()))?;
                    let ran = scope
                        .pool()
                        .bounded(async {
                            if ctx.is_stopped() {
                                return Ok(None);
                            }
                            node.run(&ctx).await.map(Some)
                        })
                        .await?;
                    match ran {
                        Some(result) => result,
                        None => {
                            debug!(node = %node.name(), "stopped while waiting for a worker");
                            return Ok((ctx, Value::Null));
                        }
                    }
                }
                None => node.run(&ctx).await?,
            };

            if let Some(key) = node.output_key() {
                ctx.insert(key, result.clone());
            }
            debug!(node = %node.name(), "finished node");
            drop(guard);
            Ok((ctx, result))
        })
    }

    /// Start on a handle to `ctx` and return only the result.
    pub fn call(self: &Arc<Self>, ctx: &Context) -> BoxFuture<'static, Result<Value>> {
        let started = self.start(ctx.clone());
        Box::pin(async move { started.await.map(|(_, result)| result) })
    }

    /// Submit `start` to the scope's pool.
    pub fn spawn(
        self: &Arc<Self>,
        scope: &ExecutionScope,
        ctx: Context,
    ) -> JoinHandle<Result<(Context, Value)>> {
        scope.pool().submit(self.start(ctx))
    }

    /// Terminal stop of this node and everything below it.
    pub fn abort(&self) {
        if self.base().flags.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(node = %self.name(), "aborting node");
        for child in self.nested_nodes() {
            child.abort();
        }
    }

    /// Interrupt a pending prefetch, wait for it to settle, then reset so the
    /// node can be prefetched again.
    ///
    /// A cancel issued while another is in flight waits for that one to
    /// settle before returning.
    pub fn cancel(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        self.cancel_below(Vec::new())
    }

    /// `above` lists the nodes whose cancel led here; meeting one again
    /// means the graph loops back on itself.
    fn cancel_below(self: &Arc<Self>, mut above: Vec<usize>) -> BoxFuture<'static, ()> {
        let node = Arc::clone(self);
        Box::pin(async move {
            let id = Arc::as_ptr(&node) as *const () as usize;
            if above.contains(&id) {
                return;
            }
            above.push(id);
            let base = node.base();
            let _settling = base.settling.lock().await;
            base.flags.cancelled.store(true, Ordering::SeqCst);
            for child in node.nested_nodes() {
                child.cancel_below(above.clone()).await;
            }
            let pending = base.prefetched.lock().unwrap().take();
            if let Some(pending) = pending {
                debug!(node = %node.name(), "waiting for cancelled prefetch");
                let _ = pending.handle.await;
            }
            base.flags.cancelled.store(false, Ordering::SeqCst);
        })
    }

    /// Start computing this node's result in the background.
    ///
    /// The next `start` of the node within the same execution returns the
    /// prefetched result instead of running again.
    pub fn prefetch(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        self.ensure_built()?;
        if !self.is_atomic() {
            return match self.prefetch_target() {
                Some(target) => target.prefetch(ctx),
                None => Err(TrellisError::PrefetchUnsupported(self.name().to_string())),
            };
        }
        let scope = ctx
            .scope()
            .ok_or_else(|| TrellisError::NoExecution(self.name().to_string()))?;
        let mut slot = self.base().prefetched.lock().unwrap();
        if slot.is_some() {
            return Err(TrellisError::AlreadyPrefetched(self.name().to_string()));
        }
        debug!(node = %self.name(), scope = %scope.id(), "prefetching node");
        let node = Arc::clone(self);
        let ctx = ctx.clone();
        let pool = scope.pool();
        let handle = pool.submit(pool.bounded(async move { node.run(&ctx).await }));
        *slot = Some(Prefetch {
            scope: scope.id().to_string(),
            handle,
        });
        Ok(())
    }

    pub fn is_prefetched(&self) -> bool {
        self.base().is_prefetched()
    }

    /// Declarative form of the node. Builds it first.
    pub fn config(&self) -> Result<NodeConfig> {
        self.ensure_built()?;
        let base = self.base();
        Ok(NodeConfig {
            name: Some(base.name.clone()),
            output_key: base.output_key.clone(),
            start_prefetch: base.start_prefetch.clone(),
            stop_prefetch: base.stop_prefetch.clone(),
            kind: self.kind()?,
        })
    }

    /// New node with the same configuration and a fresh name.
    pub fn clone_node(&self) -> Result<Arc<dyn Node>> {
        let mut config = self.config()?;
        config.name = None;
        self.base().registry()?.create(config)
    }

    pub fn describe(&self) -> String {
        let class = self.class_name();
        let mut out = format!("== {} ==\n", class.strip_suffix("Node").unwrap_or(class));
        if !self.name().starts_with(class) {
            out.push_str(&format!("- Name : {}\n", self.name()));
        }
        if let Some(key) = self.output_key() {
            out.push_str(&format!("- Output key : {key}\n"));
        }
        for (label, value) in self.details() {
            out.push_str(&format!("- {label} : {value}\n"));
        }
        out
    }

    fn on_start(&self, ctx: &Context) {
        let Some(links) = self.base().links.get() else {
            return;
        };
        for target in &links.start {
            match target.prefetch(ctx) {
                Ok(()) => {}
                Err(TrellisError::AlreadyPrefetched(_)) => {
                    debug!(node = %target.name(), "prefetch already pending");
                }
                Err(e) => warn!(node = %target.name(), error = %e, "prefetch failed"),
            }
        }
        if let Some(scope) = ctx.scope() {
            for target in &links.stop {
                scope.pool().submit(target.cancel());
            }
        }
    }
}

impl fmt::Display for dyn Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} name={}>", self.class_name(), self.name())
    }
}

/// Items of an iterable value: array elements, object keys or characters.
pub fn iter_items(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map.into_iter().map(|(k, _)| Value::String(k)).collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        other => Err(TrellisError::Type(format!("{other} is not iterable"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iter_items() {
        assert_eq!(iter_items(json!([1, 2])).unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(
            iter_items(json!({"a": 1, "b": 2})).unwrap(),
            vec![json!("a"), json!("b")]
        );
        assert_eq!(iter_items(json!("ab")).unwrap(), vec![json!("a"), json!("b")]);
        assert!(matches!(iter_items(json!(3)), Err(TrellisError::Type(_))));
    }

    #[tokio::test]
    async fn test_output_key_is_written() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::value(json!(7)).with_output_key("seven"))
            .unwrap();
        let (ctx, result) = node.start(Context::new()).await.unwrap();
        assert_eq!(result, json!(7));
        assert_eq!(ctx.get("seven"), Some(json!(7)));
        assert!(ctx.scope().is_none());
    }

    #[tokio::test]
    async fn test_aborted_context_skips_node() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::value(json!(1)).with_output_key("out"))
            .unwrap();
        let ctx = Context::new();
        ctx.abort();
        let (ctx, result) = node.start(ctx).await.unwrap();
        assert_eq!(result, Value::Null);
        assert!(!ctx.contains("out"));
    }

    #[tokio::test]
    async fn test_build_failure_is_cached() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::sequential(["missing".into()]))
            .unwrap();
        let first = node.call(&Context::new()).await.unwrap_err();
        assert!(matches!(first, TrellisError::Build { .. }));
        registry
            .create(NodeConfig::value(json!(1)).named("missing"))
            .unwrap();
        let second = node.call(&Context::new()).await.unwrap_err();
        assert!(second.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_prefetch_requires_execution() {
        let registry = NodeRegistry::default();
        let node = registry.create(NodeConfig::value(json!(1))).unwrap();
        assert!(matches!(
            node.prefetch(&Context::new()),
            Err(TrellisError::NoExecution(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_is_harvested_once() {
        let registry = NodeRegistry::default();
        let node = registry.create(NodeConfig::value(json!("ready"))).unwrap();
        let ctx = Context::new();
        let _guard = ExecutionScope::open(&ctx, "test", 2);

        node.prefetch(&ctx).unwrap();
        assert!(node.is_prefetched());
        assert!(matches!(
            node.prefetch(&ctx),
            Err(TrellisError::AlreadyPrefetched(_))
        ));
        assert_eq!(node.call(&ctx).await.unwrap(), json!("ready"));
        assert!(!node.is_prefetched());
    }

    #[tokio::test]
    async fn test_cancel_resets_prefetch() {
        let registry = NodeRegistry::default();
        let node = registry.create(NodeConfig::value(json!(1))).unwrap();
        let ctx = Context::new();
        let _guard = ExecutionScope::open(&ctx, "test", 2);

        node.prefetch(&ctx).unwrap();
        node.cancel().await;
        assert!(!node.is_prefetched());
        assert!(!node.base().is_cancelled());
        node.prefetch(&ctx).unwrap();
    }

    #[tokio::test]
    async fn test_composite_prefetch_delegates_or_fails() {
        let registry = NodeRegistry::default();
        let first = registry.create(NodeConfig::value(json!(1)).named("first")).unwrap();
        let seq = registry
            .create(NodeConfig::sequential(["first".into()]))
            .unwrap();
        let par = registry
            .create(NodeConfig::parallel(["first".into()]))
            .unwrap();
        let ctx = Context::new();
        let _guard = ExecutionScope::open(&ctx, "test", 2);

        seq.prefetch(&ctx).unwrap();
        assert!(first.is_prefetched());
        assert!(matches!(
            par.prefetch(&ctx),
            Err(TrellisError::PrefetchUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_propagates() {
        let registry = NodeRegistry::default();
        let inner = registry.create(NodeConfig::value(json!(1)).named("inner")).unwrap();
        let outer = registry
            .create(NodeConfig::sequential(["inner".into()]))
            .unwrap();
        outer.ensure_built().unwrap();
        outer.abort();
        assert!(inner.base().is_aborted());
        assert_eq!(outer.call(&Context::new()).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_describe() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(
                NodeConfig::context_value("question")
                    .named("ask")
                    .with_output_key("q"),
            )
            .unwrap();
        assert_eq!(
            node.to_string(),
            "== ContextValue ==\n- Name : ask\n- Output key : q\n- Key : question\n"
        );
    }
}
