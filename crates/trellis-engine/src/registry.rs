use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde_json::Value;
use tracing::debug;
use trellis_core::{LanguageModel, Result, Tool, TrellisConfig, TrellisError};
use uuid::Uuid;

use crate::config::{NodeConfig, NodeFn, NodeKind, NodeRef};
use crate::node::{Node, NodeBase};
use crate::nodes;

/// Builds nodes of a class registered with [`NodeRegistry::register_class`].
/// Factories create their node through [`NodeRegistry::insert_with`].
pub type ClassFactory =
    Arc<dyn Fn(&NodeRegistry, &NodeConfig) -> Result<Arc<dyn Node>> + Send + Sync>;

pub(crate) struct RegistryInner {
    config: TrellisConfig,
    nodes: Mutex<HashMap<String, Arc<dyn Node>>>,
    functions: Mutex<HashMap<String, NodeFn>>,
    models: Mutex<HashMap<String, Arc<dyn LanguageModel>>>,
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
    classes: Mutex<HashMap<String, ClassFactory>>,
}

/// Named nodes plus the functions, models, tools and node classes that
/// declarative configs refer to.
///
/// Creating a node under a name that already exists returns the existing
/// node. Unnamed nodes are named after their class, suffixed `-1`, `-2`, …
/// on collision.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(TrellisConfig::default())
    }
}

impl NodeRegistry {
    pub fn new(config: TrellisConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                nodes: Mutex::new(HashMap::new()),
                functions: Mutex::new(HashMap::new()),
                models: Mutex::new(HashMap::new()),
                tools: Mutex::new(HashMap::new()),
                classes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Process-wide registry with the default configuration.
    pub fn global() -> &'static NodeRegistry {
        static GLOBAL: OnceLock<NodeRegistry> = OnceLock::new();
        GLOBAL.get_or_init(NodeRegistry::default)
    }

    pub(crate) fn upgrade(inner: &Weak<RegistryInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &TrellisConfig {
        &self.inner.config
    }

    // ── Nodes ───────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Result<Arc<dyn Node>> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::NodeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.nodes.lock().unwrap().contains_key(name)
    }

    /// Registered node names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.nodes.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.inner.nodes.lock().unwrap().remove(name)
    }

    /// Store `node` under its own name, replacing any previous entry.
    pub fn register(&self, node: Arc<dyn Node>) -> Arc<dyn Node> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .insert(node.name().to_string(), Arc::clone(&node));
        node
    }

    /// Get-or-create a node of a custom type.
    ///
    /// `make` receives the node's base, already named, and is not called
    /// when `name` is taken.
    pub fn insert_with<N, F>(&self, class_name: &str, name: Option<&str>, make: F) -> Arc<dyn Node>
    where
        N: Node,
        F: FnOnce(NodeBase) -> N,
    {
        let mut nodes = self.inner.nodes.lock().unwrap();
        if let Some(existing) = name.and_then(|n| nodes.get(n)) {
            return Arc::clone(existing);
        }
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| unique_name(&nodes, class_name));
        let base = NodeBase::new(name.clone(), class_name, Arc::downgrade(&self.inner));
        let node: Arc<dyn Node> = Arc::new(make(base));
        nodes.insert(name, Arc::clone(&node));
        node
    }

    /// Get-or-create the node a config describes.
    pub fn create(&self, config: NodeConfig) -> Result<Arc<dyn Node>> {
        if let Some(existing) = config.name.as_deref().and_then(|n| self.get(n).ok()) {
            return Ok(existing);
        }
        if let NodeKind::Custom { class_name, .. } = &config.kind {
            let factory = self
                .inner
                .classes
                .lock()
                .unwrap()
                .get(class_name)
                .cloned()
                .ok_or_else(|| TrellisError::UnknownClass(class_name.clone()))?;
            return factory(self, &config);
        }

        let mut nodes = self.inner.nodes.lock().unwrap();
        if let Some(existing) = config.name.as_deref().and_then(|n| nodes.get(n)) {
            return Ok(Arc::clone(existing));
        }
        let class_name = config.class_name().to_string();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| unique_name(&nodes, &class_name));
        let base = NodeBase::new(name.clone(), &class_name, Arc::downgrade(&self.inner))
            .with_output_key(config.output_key)
            .with_prefetch(config.start_prefetch, config.stop_prefetch);
        let node = nodes::instantiate(base, config.kind)?;
        nodes.insert(name.clone(), Arc::clone(&node));
        debug!(node = %name, class = %class_name, "node created");
        Ok(node)
    }

    /// Live node a reference points to. Closures are registered as
    /// anonymous functions and wrapped in a function node.
    pub fn resolve(&self, node: &NodeRef) -> Result<Arc<dyn Node>> {
        match node {
            NodeRef::Name(name) => self.get(name),
            NodeRef::Config(config) => self.create((**config).clone()),
            NodeRef::Node(node) => {
                if !self.contains(node.name()) {
                    self.register(Arc::clone(node));
                }
                Ok(Arc::clone(node))
            }
            NodeRef::Func(func) => {
                let name = self.insert_function(Arc::clone(func));
                self.create(NodeConfig::function(name))
            }
        }
    }

    /// Parse a JSON or TOML workflow and create its root node.
    pub fn load_workflow(&self, text: &str) -> Result<Arc<dyn Node>> {
        self.create(NodeConfig::parse(text)?)
    }

    pub fn load_workflow_file(&self, path: &Path) -> Result<Arc<dyn Node>> {
        let text = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => NodeConfig::from_json(&text)?,
            Some("toml") => NodeConfig::from_toml(&text)?,
            _ => NodeConfig::parse(&text)?,
        };
        debug!(path = %path.display(), class = %config.class_name(), "loaded workflow");
        self.create(config)
    }

    // ── Collaborators ───────────────────────────────────────────

    pub fn register_function(
        &self,
        name: impl Into<String>,
        func: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.inner
            .functions
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(func));
    }

    /// Register an anonymous function and return its generated name.
    pub fn function(&self, func: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> String {
        self.insert_function(Arc::new(func))
    }

    fn insert_function(&self, func: NodeFn) -> String {
        let name = format!("fn:{}", Uuid::new_v4());
        self.inner
            .functions
            .lock()
            .unwrap()
            .insert(name.clone(), func);
        name
    }

    pub fn get_function(&self, name: &str) -> Result<NodeFn> {
        self.inner
            .functions
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::FunctionNotFound(name.to_string()))
    }

    pub fn register_model(&self, model: Arc<dyn LanguageModel>) {
        let name = model.name().to_string();
        self.inner.models.lock().unwrap().insert(name, model);
    }

    pub fn model(&self, name: &str) -> Result<Arc<dyn LanguageModel>> {
        self.inner
            .models
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::ModelNotFound(name.to_string()))
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.inner.tools.lock().unwrap().insert(name, tool);
    }

    pub fn tool(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.inner
            .tools
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::ToolNotFound(name.to_string()))
    }

    pub fn register_class(
        &self,
        class_name: impl Into<String>,
        factory: impl Fn(&NodeRegistry, &NodeConfig) -> Result<Arc<dyn Node>> + Send + Sync + 'static,
    ) {
        self.inner
            .classes
            .lock()
            .unwrap()
            .insert(class_name.into(), Arc::new(factory));
    }
}

fn unique_name(nodes: &HashMap<String, Arc<dyn Node>>, class_name: &str) -> String {
    if !nodes.contains_key(class_name) {
        return class_name.to_string();
    }
    (1..)
        .map(|i| format!("{class_name}-{i}"))
        .find(|candidate| !nodes.contains_key(candidate))
        .unwrap_or_else(|| format!("{class_name}-{}", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use futures::future::BoxFuture;
    use serde_json::json;

    struct Foo {
        base: NodeBase,
    }

    impl Node for Foo {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn run<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move { Ok(json!("foo")) })
        }
    }

    fn with_foo() -> NodeRegistry {
        let registry = NodeRegistry::default();
        registry.register_class("Foo", |registry, config| {
            let output_key = config.output_key.clone();
            Ok(registry.insert_with("Foo", config.name.as_deref(), |base| Foo {
                base: base.with_output_key(output_key),
            }))
        });
        registry
    }

    #[test]
    fn test_unnamed_nodes_are_suffixed() {
        let registry = with_foo();
        let names: Vec<String> = (0..3)
            .map(|_| {
                registry
                    .load_workflow(r#"{"class_name": "Foo"}"#)
                    .unwrap()
                    .name()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["Foo", "Foo-1", "Foo-2"]);
    }

    #[test]
    fn test_named_nodes_are_reused() {
        let registry = NodeRegistry::default();
        let a = registry
            .create(NodeConfig::value(json!(1)).named("answer"))
            .unwrap();
        let b = registry
            .create(NodeConfig::value(json!(2)).named("answer"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_class() {
        let registry = NodeRegistry::default();
        let result = registry.load_workflow(r#"{"class_name": "Nope"}"#);
        assert!(matches!(result, Err(TrellisError::UnknownClass(c)) if c == "Nope"));
    }

    #[tokio::test]
    async fn test_custom_class_in_workflow() {
        let registry = with_foo();
        let root = registry
            .load_workflow(
                r#"{"class_name": "SequentialExecution", "nodes": [{"class_name": "Foo", "output_key": "f"}]}"#,
            )
            .unwrap();
        let (ctx, result) = root.start(Context::new()).await.unwrap();
        assert_eq!(result, json!("foo"));
        assert_eq!(ctx.get("f"), Some(json!("foo")));
    }

    #[tokio::test]
    async fn test_closure_children_become_function_nodes() {
        let registry = NodeRegistry::default();
        let node = registry
            .resolve(&NodeRef::func(|ctx| Ok(json!(ctx["x"].as_i64().unwrap_or(0) * 2))))
            .unwrap();
        assert_eq!(node.class_name(), "FunctionNode");
        let config = node.config().unwrap();
        let NodeKind::Function { func, .. } = config.kind else {
            panic!("expected a function config");
        };
        assert!(func.starts_with("fn:"));

        let mut map = serde_json::Map::new();
        map.insert("x".into(), json!(21));
        assert_eq!(node.call(&Context::from(map)).await.unwrap(), json!(42));
    }

    #[test]
    fn test_missing_collaborators() {
        let registry = NodeRegistry::default();
        assert!(matches!(registry.get("x"), Err(TrellisError::NodeNotFound(_))));
        assert!(matches!(registry.model("x"), Err(TrellisError::ModelNotFound(_))));
        assert!(matches!(registry.tool("x"), Err(TrellisError::ToolNotFound(_))));
        assert!(matches!(
            registry.get_function("x"),
            Err(TrellisError::FunctionNotFound(_))
        ));
    }

    #[test]
    fn test_clone_node_gets_fresh_name() {
        let registry = NodeRegistry::default();
        let node = registry
            .create(NodeConfig::context_value("k").named("reader").with_output_key("out"))
            .unwrap();
        let copy = node.clone_node().unwrap();
        assert_eq!(copy.name(), "ContextValueNode");
        assert_eq!(copy.output_key(), Some("out"));
        assert!(registry.contains("reader"));
    }

    #[test]
    fn test_remove_and_names() {
        let registry = NodeRegistry::default();
        registry.create(NodeConfig::value(json!(1)).named("b")).unwrap();
        registry.create(NodeConfig::value(json!(2)).named("a")).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.remove("a").is_some());
        assert!(!registry.contains("a"));
    }
}
