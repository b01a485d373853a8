use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use trellis_core::{display_value, truthy, Result, TrellisError};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    Text,
    Json,
    Python,
}

/// Pulls pattern matches out of a text held in the context.
///
/// Matching spans lines. With no capture group each match is returned
/// whole, with one group the group text, with several an array of groups.
/// A single match is returned as-is, several as an array.
pub struct TextExtractorNode {
    base: NodeBase,
    source_key: String,
    pattern: String,
    regex: Regex,
    flavor: Flavor,
}

impl TextExtractorNode {
    pub(crate) fn new(
        base: NodeBase,
        source_key: String,
        pattern: String,
        flavor: Flavor,
    ) -> Result<Self> {
        let regex = Regex::new(&format!("(?s){pattern}"))
            .map_err(|e| TrellisError::InvalidConfig(format!("bad pattern {pattern}: {e}")))?;
        Ok(Self {
            base,
            source_key,
            pattern,
            regex,
            flavor,
        })
    }

    fn find_all(&self, text: &str) -> Vec<Value> {
        let groups = self.regex.captures_len() - 1;
        let group = |caps: &regex::Captures<'_>, i: usize| {
            Value::String(caps.get(i).map_or("", |m| m.as_str()).to_string())
        };
        self.regex
            .captures_iter(text)
            .map(|caps| match groups {
                0 => group(&caps, 0),
                1 => group(&caps, 1),
                n => Value::Array((1..=n).map(|i| group(&caps, i)).collect()),
            })
            .collect()
    }

    fn no_match(&self) -> TrellisError {
        TrellisError::NoMatch {
            pattern: self.pattern.clone(),
            key: self.source_key.clone(),
        }
    }
}

fn parse_json(value: Value) -> Result<Value> {
    match value {
        Value::String(text) => Ok(serde_json::from_str(&text)?),
        other => Err(TrellisError::Type(format!(
            "cannot parse {other} as JSON text"
        ))),
    }
}

impl Node for TextExtractorNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let text = match ctx.get(&self.source_key) {
                Some(value) if truthy(&value) => display_value(&value),
                _ => return Err(TrellisError::MissingKey(self.source_key.clone())),
            };
            let mut matches = self.find_all(&text);
            if matches.is_empty() {
                // Models often answer with bare JSON instead of a fenced block.
                let start = match self.flavor {
                    Flavor::Json => text.find('{').ok_or_else(|| self.no_match())?,
                    _ => return Err(self.no_match()),
                };
                matches.push(Value::String(text[start..].trim().to_string()));
            }
            if self.flavor == Flavor::Json {
                matches = matches.into_iter().map(parse_json).collect::<Result<_>>()?;
            }
            Ok(if matches.len() == 1 {
                matches.remove(0)
            } else {
                Value::Array(matches)
            })
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        let source_key = self.source_key.clone();
        let pattern = self.pattern.clone();
        Ok(match self.flavor {
            Flavor::Text => NodeKind::TextExtractor {
                source_key,
                pattern,
            },
            Flavor::Json => NodeKind::JsonExtractor {
                source_key,
                pattern,
            },
            Flavor::Python => NodeKind::PythonExtractor {
                source_key,
                pattern,
            },
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Input key", self.source_key.clone()),
            ("Pattern", self.pattern.clone()),
        ]
    }
}
