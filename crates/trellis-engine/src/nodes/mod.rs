//! Built-in node classes.

mod code;
mod condition;
mod dispatcher;
mod execution;
mod extractor;
mod function;
mod interaction;
mod iterator;
mod llm;
mod logic;
mod loops;
mod value;
mod web;

use std::sync::Arc;

use trellis_core::{Result, TrellisError};

use crate::config::NodeKind;
use crate::node::{Child, Node, NodeBase};
use crate::registry::NodeRegistry;

pub use code::CodeNode;
pub use condition::{BranchingNode, ConditionNode};
pub use dispatcher::DispatcherNode;
pub use execution::{ParallelNode, SequentialNode};
pub use extractor::TextExtractorNode;
pub use function::FunctionNode;
pub use interaction::{CliNode, PrintNode};
pub use iterator::{ParallelIteratorNode, SequentialIteratorNode};
pub use llm::LlmNode;
pub use logic::AnyNode;
pub use loops::LoopNode;
pub use value::{ContextValueNode, ValueNode};
pub use web::{parse_search_results, strip_html_tags, WebNode};

use extractor::Flavor;

/// Construct the built-in node a declarative kind describes. Children are
/// only resolved when the node is built.
pub(crate) fn instantiate(base: NodeBase, kind: NodeKind) -> Result<Arc<dyn Node>> {
    let node: Arc<dyn Node> = match kind {
        NodeKind::Value { value } => Arc::new(ValueNode::new(base, value)),
        NodeKind::ContextValue { key } => Arc::new(ContextValueNode::new(base, key)),
        NodeKind::Function { func, source_key } => {
            Arc::new(FunctionNode::new(base, func, source_key))
        }
        NodeKind::TextExtractor { source_key, pattern } => Arc::new(TextExtractorNode::new(
            base,
            source_key,
            pattern,
            Flavor::Text,
        )?),
        NodeKind::JsonExtractor { source_key, pattern } => Arc::new(TextExtractorNode::new(
            base,
            source_key,
            pattern,
            Flavor::Json,
        )?),
        NodeKind::PythonExtractor { source_key, pattern } => Arc::new(TextExtractorNode::new(
            base,
            source_key,
            pattern,
            Flavor::Python,
        )?),
        NodeKind::Print { key } => Arc::new(PrintNode::new(base, key)),
        NodeKind::Cli { prompt } => Arc::new(CliNode::new(base, prompt)),
        NodeKind::Web { source_key } => Arc::new(WebNode::new(base, source_key)),
        NodeKind::Llm {
            model,
            method,
            mapping,
            source_key,
            keep_history,
            kwargs,
        } => Arc::new(LlmNode::new(
            base,
            llm::LlmSettings {
                model,
                method,
                mapping,
                source_key,
                keep_history,
                kwargs,
            },
        )),
        NodeKind::Code {
            source_key,
            tools,
            tool_kwargs,
            inputs,
            format,
        } => Arc::new(CodeNode::new(
            base,
            code::CodeSettings {
                source_key,
                tools,
                tool_kwargs,
                inputs,
                format,
            },
        )),
        NodeKind::Sequential { nodes } => Arc::new(SequentialNode::new(base, nodes)),
        NodeKind::Parallel { nodes } => Arc::new(ParallelNode::new(base, nodes)),
        NodeKind::Dispatcher { branches } => Arc::new(DispatcherNode::new(base, branches)),
        NodeKind::Any {
            body,
            iterable,
            item_key,
        } => Arc::new(AnyNode::new(base, body, iterable, item_key)),
        NodeKind::Condition {
            condition,
            true_node,
            false_node,
        } => Arc::new(ConditionNode::new(base, condition, true_node, false_node)),
        NodeKind::Branching {
            condition,
            branches,
        } => Arc::new(BranchingNode::new(base, condition, branches)),
        NodeKind::Loop {
            body,
            cond,
            max_iter,
        } => Arc::new(LoopNode::new(base, body, cond, max_iter)),
        NodeKind::SequentialIterator {
            body,
            iterable,
            item_key,
        } => Arc::new(SequentialIteratorNode::new(base, body, iterable, item_key)),
        NodeKind::ParallelIterator {
            body,
            iterable,
            item_key,
        } => Arc::new(ParallelIteratorNode::new(base, body, iterable, item_key)),
        NodeKind::Custom { class_name, .. } => return Err(TrellisError::UnknownClass(class_name)),
    };
    Ok(node)
}

fn build_all(children: &[Child], registry: &NodeRegistry) -> Result<()> {
    for child in children {
        child.resolve(registry)?;
    }
    Ok(())
}

fn built(children: &[Child]) -> Vec<Arc<dyn Node>> {
    children.iter().filter_map(|c| c.built().cloned()).collect()
}

fn labels(children: &[Child]) -> String {
    children
        .iter()
        .map(Child::label)
        .collect::<Vec<_>>()
        .join(", ")
}
