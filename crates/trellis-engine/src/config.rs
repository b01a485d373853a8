//! Declarative node descriptions.
//!
//! A workflow is a tree of [`NodeConfig`] objects, written as JSON or TOML:
//! `{class_name, name?, output_key?, start_prefetch?, stop_prefetch?, ...}`
//! plus the fields of the node class. Child fields accept a registry name
//! or a nested config; condition and iterable fields additionally accept a
//! context key or a literal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use trellis_core::{Result, TrellisError};

use crate::node::Node;

/// Closure wrapped by a function node. Receives the whole context as an
/// object, or the value under the node's `source_key`.
pub type NodeFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Reference to a child node.
#[derive(Clone)]
pub enum NodeRef {
    /// Existing node in the registry.
    Name(String),
    /// Node created (or reused, when named) from a nested config.
    Config(Box<NodeConfig>),
    /// Live node.
    Node(Arc<dyn Node>),
    /// Closure, wrapped in a function node at build time.
    Func(NodeFn),
}

impl NodeRef {
    pub fn func(f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }
}

impl From<&str> for NodeRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for NodeRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<NodeConfig> for NodeRef {
    fn from(config: NodeConfig) -> Self {
        Self::Config(Box::new(config))
    }
}

impl From<Arc<dyn Node>> for NodeRef {
    fn from(node: Arc<dyn Node>) -> Self {
        Self::Node(node)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Config(config) => f.debug_tuple("Config").field(config).finish(),
            Self::Node(node) => f.debug_tuple("Node").field(&node.name()).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl Serialize for NodeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Name(name) => serializer.serialize_str(name),
            Self::Config(config) => config.serialize(serializer),
            Self::Node(node) => node
                .config()
                .map_err(S::Error::custom)?
                .serialize(serializer),
            Self::Func(_) => Err(S::Error::custom(
                "an unbuilt closure reference cannot be serialized",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for NodeRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(Self::Name(name)),
            value @ Value::Object(_) => NodeConfig::from_value(value)
                .map(|c| Self::Config(Box::new(c)))
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "expected a node name or a node config, got {other}"
            ))),
        }
    }
}

/// Input of a condition or iterable field.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Read this context key.
    Key(String),
    Node(NodeRef),
    /// Constant. Strings are always read as context keys.
    Literal(Value),
}

impl From<&str> for Operand {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<NodeRef> for Operand {
    fn from(node: NodeRef) -> Self {
        Self::Node(node)
    }
}

impl From<NodeConfig> for Operand {
    fn from(config: NodeConfig) -> Self {
        Self::Node(config.into())
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        match value {
            Value::String(key) => Self::Key(key),
            other => Self::Literal(other),
        }
    }
}

impl Serialize for Operand {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Key(key) => serializer.serialize_str(key),
            Self::Node(node) => node.serialize(serializer),
            Self::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Operand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(key) => Ok(Self::Key(key)),
            value @ Value::Object(_) => NodeConfig::from_value(value)
                .map(|c| Self::Node(NodeRef::Config(Box::new(c))))
                .map_err(D::Error::custom),
            literal => Ok(Self::Literal(literal)),
        }
    }
}

/// Keyed children of dispatcher and branching nodes, in declaration order.
///
/// Accepted as an object or as `[key, node]` pairs; non-string keys are
/// stored as their JSON text.
pub type Branches = Vec<(String, NodeRef)>;

mod branches {
    use super::*;

    pub fn serialize<S: Serializer>(
        branches: &Branches,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(branches.iter().map(|(k, v)| (k, v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Branches, D::Error> {
        let entries: Vec<(Value, Value)> = match Value::deserialize(deserializer)? {
            Value::Object(map) => map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            Value::Array(pairs) => pairs
                .into_iter()
                .map(|pair| match pair {
                    Value::Array(mut kv) if kv.len() == 2 => {
                        let node = kv.pop().unwrap_or_default();
                        let key = kv.pop().unwrap_or_default();
                        Ok((key, node))
                    }
                    other => Err(D::Error::custom(format!(
                        "expected a [key, node] pair, got {other}"
                    ))),
                })
                .collect::<std::result::Result<_, _>>()?,
            other => {
                return Err(D::Error::custom(format!(
                    "expected branches as an object or a list of pairs, got {other}"
                )))
            }
        };
        entries
            .into_iter()
            .map(|(key, node)| {
                let node = NodeRef::deserialize(node).map_err(D::Error::custom)?;
                Ok((branch_key(&key), node))
            })
            .collect()
    }
}

/// Text a value is matched against branch keys with.
pub fn branch_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn default_method() -> String {
    "answer".into()
}
fn default_true() -> bool {
    true
}
fn default_json_pattern() -> String {
    r"```json\n(.*?)\n```".into()
}
fn default_python_pattern() -> String {
    r"```python\n(.*?)\n```".into()
}

/// Class-specific part of a node config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class_name")]
pub enum NodeKind {
    #[serde(rename = "ValueNode")]
    Value {
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "ContextValueNode")]
    ContextValue { key: String },
    #[serde(rename = "FunctionNode")]
    Function {
        /// Name registered with `NodeRegistry::register_function`.
        func: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_key: Option<String>,
    },
    #[serde(rename = "TextExtractorNode")]
    TextExtractor { source_key: String, pattern: String },
    #[serde(rename = "JSONExtractorNode")]
    JsonExtractor {
        source_key: String,
        #[serde(default = "default_json_pattern")]
        pattern: String,
    },
    #[serde(rename = "PythonExtractorNode")]
    PythonExtractor {
        source_key: String,
        #[serde(default = "default_python_pattern")]
        pattern: String,
    },
    #[serde(rename = "PrintNode")]
    Print { key: String },
    #[serde(rename = "CLINode")]
    Cli {
        #[serde(default)]
        prompt: String,
    },
    #[serde(rename = "WebNode")]
    Web { source_key: String },
    #[serde(rename = "LLMNode")]
    Llm {
        model: String,
        #[serde(default = "default_method")]
        method: String,
        /// Extra keyword arguments: `{kwarg: context_key}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mapping: Option<BTreeMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_key: Option<String>,
        #[serde(default = "default_true")]
        keep_history: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        kwargs: Map<String, Value>,
    },
    #[serde(rename = "CodeNode")]
    Code {
        source_key: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        tool_kwargs: Map<String, Value>,
        /// Context keys exposed to the snippet as globals.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<String>,
        /// Return the rendered report instead of the structured result.
        #[serde(default)]
        format: bool,
    },
    #[serde(rename = "SequentialExecution", alias = "Sequential", alias = "Graph")]
    Sequential { nodes: Vec<NodeRef> },
    #[serde(rename = "ParallelExecution", alias = "Parallel")]
    Parallel { nodes: Vec<NodeRef> },
    #[serde(rename = "DispatcherNode")]
    Dispatcher {
        #[serde(with = "branches")]
        branches: Branches,
    },
    #[serde(rename = "AnyNode")]
    Any {
        body: NodeRef,
        iterable: Operand,
        item_key: String,
    },
    #[serde(rename = "ConditionNode")]
    Condition {
        condition: Operand,
        true_node: NodeRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_node: Option<NodeRef>,
    },
    #[serde(rename = "BranchingNode")]
    Branching {
        condition: Operand,
        #[serde(with = "branches")]
        branches: Branches,
    },
    #[serde(rename = "LoopNode")]
    Loop {
        body: NodeRef,
        #[serde(default, alias = "condition", skip_serializing_if = "Option::is_none")]
        cond: Option<Operand>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iter: Option<usize>,
    },
    #[serde(rename = "SequentialIteratorNode")]
    SequentialIterator {
        body: NodeRef,
        iterable: Operand,
        item_key: String,
    },
    #[serde(rename = "ParallelIteratorNode")]
    ParallelIterator {
        body: NodeRef,
        iterable: Operand,
        item_key: String,
    },
    /// Class registered with `NodeRegistry::register_class`.
    #[serde(skip)]
    Custom {
        class_name: String,
        fields: Map<String, Value>,
    },
}

const BUILTIN_CLASSES: &[&str] = &[
    "ValueNode",
    "ContextValueNode",
    "FunctionNode",
    "TextExtractorNode",
    "JSONExtractorNode",
    "PythonExtractorNode",
    "PrintNode",
    "CLINode",
    "WebNode",
    "LLMNode",
    "CodeNode",
    "SequentialExecution",
    "Sequential",
    "Graph",
    "ParallelExecution",
    "Parallel",
    "DispatcherNode",
    "AnyNode",
    "ConditionNode",
    "BranchingNode",
    "LoopNode",
    "SequentialIteratorNode",
    "ParallelIteratorNode",
];

impl NodeKind {
    pub fn class_name(&self) -> &str {
        match self {
            Self::Value { .. } => "ValueNode",
            Self::ContextValue { .. } => "ContextValueNode",
            Self::Function { .. } => "FunctionNode",
            Self::TextExtractor { .. } => "TextExtractorNode",
            Self::JsonExtractor { .. } => "JSONExtractorNode",
            Self::PythonExtractor { .. } => "PythonExtractorNode",
            Self::Print { .. } => "PrintNode",
            Self::Cli { .. } => "CLINode",
            Self::Web { .. } => "WebNode",
            Self::Llm { .. } => "LLMNode",
            Self::Code { .. } => "CodeNode",
            Self::Sequential { .. } => "SequentialExecution",
            Self::Parallel { .. } => "ParallelExecution",
            Self::Dispatcher { .. } => "DispatcherNode",
            Self::Any { .. } => "AnyNode",
            Self::Condition { .. } => "ConditionNode",
            Self::Branching { .. } => "BranchingNode",
            Self::Loop { .. } => "LoopNode",
            Self::SequentialIterator { .. } => "SequentialIteratorNode",
            Self::ParallelIterator { .. } => "ParallelIteratorNode",
            Self::Custom { class_name, .. } => class_name,
        }
    }
}

/// Full declarative form of a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: Option<String>,
    pub output_key: Option<String>,
    /// Nodes prefetched when this node starts.
    pub start_prefetch: Vec<String>,
    /// Nodes whose pending prefetch is cancelled when this node starts.
    pub stop_prefetch: Vec<String>,
    pub kind: NodeKind,
}

impl NodeConfig {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: None,
            output_key: None,
            start_prefetch: Vec::new(),
            stop_prefetch: Vec::new(),
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_start_prefetch<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_prefetch = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stop_prefetch<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_prefetch = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn class_name(&self) -> &str {
        self.kind.class_name()
    }

    pub fn value(value: Value) -> Self {
        Self::new(NodeKind::Value { value })
    }

    pub fn context_value(key: impl Into<String>) -> Self {
        Self::new(NodeKind::ContextValue { key: key.into() })
    }

    pub fn function(func: impl Into<String>) -> Self {
        Self::new(NodeKind::Function {
            func: func.into(),
            source_key: None,
        })
    }

    pub fn sequential(nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        Self::new(NodeKind::Sequential {
            nodes: nodes.into_iter().collect(),
        })
    }

    pub fn parallel(nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        Self::new(NodeKind::Parallel {
            nodes: nodes.into_iter().collect(),
        })
    }

    pub fn looping(body: impl Into<NodeRef>, cond: Option<Operand>, max_iter: Option<usize>) -> Self {
        Self::new(NodeKind::Loop {
            body: body.into(),
            cond,
            max_iter,
        })
    }

    pub fn condition(
        condition: impl Into<Operand>,
        true_node: impl Into<NodeRef>,
        false_node: Option<NodeRef>,
    ) -> Self {
        Self::new(NodeKind::Condition {
            condition: condition.into(),
            true_node: true_node.into(),
            false_node,
        })
    }

    pub fn any(body: impl Into<NodeRef>, iterable: impl Into<Operand>, item_key: &str) -> Self {
        Self::new(NodeKind::Any {
            body: body.into(),
            iterable: iterable.into(),
            item_key: item_key.to_string(),
        })
    }

    /// Parse a config object. Unknown class names are kept as
    /// [`NodeKind::Custom`] and resolved by the registry.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(TrellisError::InvalidConfig(format!(
                "a node config must be an object, got {value}"
            )));
        };
        let mut class_name = match map.remove("class_name") {
            Some(Value::String(class)) => class,
            Some(other) => {
                return Err(TrellisError::InvalidConfig(format!(
                    "class_name must be a string, got {other}"
                )))
            }
            None => return Err(TrellisError::InvalidConfig("missing class_name".into())),
        };
        if class_name == "IteratorNode" {
            let parallel = map
                .remove("parallel")
                .and_then(|p| p.as_bool())
                .ok_or_else(|| {
                    TrellisError::InvalidConfig(
                        "IteratorNode needs a boolean `parallel` field".into(),
                    )
                })?;
            class_name = if parallel {
                "ParallelIteratorNode".into()
            } else {
                "SequentialIteratorNode".into()
            };
        }

        let name = take_string(&mut map, "name")?;
        let output_key = take_string(&mut map, "output_key")?;
        let start_prefetch = take_names(&mut map, "start_prefetch")?;
        let stop_prefetch = take_names(&mut map, "stop_prefetch")?;

        let kind = if BUILTIN_CLASSES.contains(&class_name.as_str()) {
            map.insert("class_name".into(), Value::String(class_name.clone()));
            serde_json::from_value(Value::Object(map))
                .map_err(|e| TrellisError::InvalidConfig(format!("{class_name}: {e}")))?
        } else {
            NodeKind::Custom {
                class_name,
                fields: map,
            }
        };
        Ok(Self {
            name,
            output_key,
            start_prefetch,
            stop_prefetch,
            kind,
        })
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut map = Map::new();
        map.insert("class_name".into(), Value::String(self.class_name().to_string()));
        if let Some(name) = &self.name {
            map.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(key) = &self.output_key {
            map.insert("output_key".into(), Value::String(key.clone()));
        }
        if !self.start_prefetch.is_empty() {
            map.insert("start_prefetch".into(), serde_json::to_value(&self.start_prefetch)?);
        }
        if !self.stop_prefetch.is_empty() {
            map.insert("stop_prefetch".into(), serde_json::to_value(&self.stop_prefetch)?);
        }
        let fields = match &self.kind {
            NodeKind::Custom { fields, .. } => fields.clone(),
            kind => match serde_json::to_value(kind)? {
                Value::Object(fields) => fields,
                _ => Map::new(),
            },
        };
        for (key, value) in fields {
            if key != "class_name" {
                map.insert(key, value);
            }
        }
        Ok(Value::Object(map))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Value =
            toml::from_str(text).map_err(|e| TrellisError::InvalidConfig(e.to_string()))?;
        Self::from_value(serde_json::to_value(table)?)
    }

    /// JSON when the text starts with `{`, TOML otherwise.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            Self::from_json(text)
        } else {
            Self::from_toml(text)
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(TrellisError::InvalidConfig(format!(
            "{key} must be a string, got {other}"
        ))),
    }
}

/// A single name or a list of names.
fn take_names(map: &mut Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| TrellisError::InvalidConfig(format!("{key}: {e}"))),
    }
}

impl Serialize for NodeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Self::from_value(Value::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}
