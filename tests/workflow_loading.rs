use std::io::Write;

use serde_json::json;
use trellis_core::TrellisConfig;
use trellis_engine::{Context, NodeRegistry};

fn write_workflow(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write workflow");
    tmp
}

#[tokio::test]
async fn test_json_workflow_runs_code_against_context() {
    let file = write_workflow(
        ".json",
        r#"{
            "class_name": "SequentialExecution",
            "name": "compute",
            "nodes": [
                {"class_name": "ContextValueNode", "key": "snippet", "output_key": "code"},
                {"class_name": "CodeNode", "name": "exec", "source_key": "code",
                 "inputs": ["base"], "output_key": "run"}
            ]
        }"#,
    );

    let registry = NodeRegistry::new(TrellisConfig::default());
    let root = registry.load_workflow_file(file.path()).expect("load workflow");
    let ctx = Context::new();
    ctx.insert("base", json!(6));
    ctx.insert("snippet", json!("```python\nanswer = base * 7\n```"));

    let (ctx, result) = root.start(ctx).await.expect("run workflow");
    assert_eq!(result["variables"]["answer"], json!(42));
    assert_eq!(ctx.get("run"), Some(result));
    assert!(registry.contains("compute"));
    assert!(registry.contains("exec"));
}

#[tokio::test]
async fn test_toml_workflow_loops_with_its_own_cap() {
    let file = write_workflow(
        ".toml",
        r#"
class_name = "LoopNode"
name = "repeat"
max_iter = 3
output_key = "last"

[body]
class_name = "ValueNode"
value = "tick"
"#,
    );

    let registry = NodeRegistry::new(TrellisConfig::default());
    let root = registry.load_workflow_file(file.path()).expect("load workflow");
    let (ctx, result) = root.start(Context::new()).await.expect("run workflow");
    assert_eq!(result, json!("tick"));
    assert_eq!(ctx.get("last"), Some(json!("tick")));
}

#[test]
fn test_unknown_extension_is_sniffed() {
    let file = write_workflow(
        ".flow",
        r#"{"class_name": "ValueNode", "name": "constant", "value": 1}"#,
    );
    let registry = NodeRegistry::default();
    let root = registry.load_workflow_file(file.path()).expect("load workflow");
    assert_eq!(root.name(), "constant");
    assert!(root.describe().contains("constant"));
}

#[test]
fn test_unknown_class_is_rejected() {
    let file = write_workflow(".json", r#"{"class_name": "TeleportNode", "name": "x"}"#);
    let registry = NodeRegistry::default();
    assert!(registry.load_workflow_file(file.path()).is_err());
    assert!(!registry.contains("x"));
}

#[test]
fn test_missing_workflow_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let registry = NodeRegistry::default();
    assert!(matches!(
        registry.load_workflow_file(&dir.path().join("nope.json")),
        Err(trellis_core::TrellisError::Io(_))
    ));
}
