use std::time::Duration;

use serde_json::{json, Value};
use trellis_engine::{Context, NodeConfig, NodeRegistry};
use trellis_test_utils::{DelayNode, ProbeNode};

const NO_DELAY: Duration = Duration::ZERO;

#[tokio::test]
async fn test_sequential_children_see_earlier_outputs() {
    let registry = NodeRegistry::default();
    let (_, second) = ProbeNode::echo(&registry, Some("second"), "text", NO_DELAY, None);
    let root = registry
        .load_workflow(
            r#"{"class_name": "SequentialExecution", "name": "main", "nodes": [
                {"class_name": "ContextValueNode", "key": "seed", "output_key": "text"},
                "second",
                {"class_name": "ValueNode", "value": "done", "output_key": "status"}
            ]}"#,
        )
        .unwrap();
    let ctx = Context::new();
    ctx.insert("seed", json!("hello"));
    let (ctx, result) = root.start(ctx).await.unwrap();

    assert_eq!(result, json!("done"));
    assert_eq!(ctx.get("text"), Some(json!("hello")));
    assert_eq!(ctx.get("status"), Some(json!("done")));
    assert_eq!(second.runs(), 1);
}

#[tokio::test]
async fn test_loop_runs_body_exactly_max_iter_times() {
    let registry = NodeRegistry::default();
    let (_, body) = ProbeNode::constant(&registry, Some("tick"), json!(1), NO_DELAY);
    let node = registry
        .create(NodeConfig::looping("tick", None, Some(4)))
        .unwrap();
    assert_eq!(node.call(&Context::new()).await.unwrap(), json!(1));
    assert_eq!(body.runs(), 4);
}

#[tokio::test]
async fn test_dispatcher_runs_only_the_active_subset() {
    let registry = NodeRegistry::default();
    let (_, a) = ProbeNode::constant(&registry, Some("a"), json!("A"), NO_DELAY);
    let (_, b) = ProbeNode::constant(&registry, Some("b"), json!("B"), NO_DELAY);
    let (_, c) = ProbeNode::constant(&registry, Some("c"), json!("C"), NO_DELAY);
    let node = registry
        .load_workflow(
            r#"{"class_name": "DispatcherNode",
                "branches": {"use_a": "a", "use_b": "b", "use_c": "c"}}"#,
        )
        .unwrap();
    let ctx = Context::new();
    ctx.insert("use_a", json!(true));
    ctx.insert("use_b", json!(false));
    ctx.insert("use_c", json!(1));

    let result = node.call(&ctx).await.unwrap();
    assert_eq!(result, json!({"use_a": "A", "use_c": "C"}));
    assert_eq!((a.runs(), b.runs(), c.runs()), (1, 0, 1));
}

#[tokio::test]
async fn test_branching_falls_back_to_default() {
    let registry = NodeRegistry::default();
    let (_, fast) = ProbeNode::constant(&registry, Some("fast"), json!("F"), NO_DELAY);
    let (_, slow) = ProbeNode::constant(&registry, Some("slow"), json!("S"), NO_DELAY);
    let node = registry
        .load_workflow(
            r#"{"class_name": "BranchingNode", "condition": "speed",
                "branches": {"fast": "fast", "default": "slow"}}"#,
        )
        .unwrap();
    let ctx = Context::new();
    ctx.insert("speed", json!("medium"));
    assert_eq!(node.call(&ctx).await.unwrap(), json!("S"));
    assert_eq!((fast.runs(), slow.runs()), (0, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_stops_sequence_inside_loop() {
    let registry = NodeRegistry::default();
    let (_, first) = ProbeNode::constant(&registry, Some("first"), json!(1), NO_DELAY);
    let (_, second) = ProbeNode::constant(&registry, Some("second"), json!(2), NO_DELAY);
    let (_, step) = ProbeNode::constant(&registry, Some("step"), json!(3), Duration::from_millis(5));
    ProbeNode::constant(&registry, Some("after"), json!(4), NO_DELAY);
    let root = registry
        .create(NodeConfig::sequential([
            "first".into(),
            "second".into(),
            NodeConfig::looping("step", None, Some(100_000)).into(),
            "after".into(),
        ]))
        .unwrap();

    let running = tokio::spawn(root.call(&Context::new()));
    tokio::time::sleep(Duration::from_millis(60)).await;
    root.abort();
    let runs_at_abort = step.runs();

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("aborted workflow should wind down")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!((first.runs(), second.runs()), (1, 1));
    assert!(runs_at_abort >= 1);
    assert!(
        step.runs() <= runs_at_abort + 1,
        "loop kept iterating after abort: {} runs, {runs_at_abort} at abort",
        step.runs()
    );
    assert!(registry.get("after").unwrap().base().is_aborted());
}

#[tokio::test]
async fn test_aborted_context_skips_everything() {
    let registry = NodeRegistry::default();
    let (_, probe) = ProbeNode::constant(&registry, Some("p"), json!(1), NO_DELAY);
    let root = registry
        .create(NodeConfig::sequential(["p".into()]))
        .unwrap();
    let ctx = Context::new();
    ctx.abort();
    assert_eq!(root.call(&ctx).await.unwrap(), Value::Null);
    assert_eq!(probe.runs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_reaches_long_running_leaf() {
    let registry = NodeRegistry::default();
    let (node, cycles) = DelayNode::register(&registry, Some("wait"));
    let running = tokio::spawn(node.call(&Context::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    node.abort();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("delay node should observe the abort")
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::Null);
    assert!(cycles.load(std::sync::atomic::Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_custom_class_from_declarative_config() {
    let registry = NodeRegistry::default();
    registry.register_class("Greeting", |registry, config| {
        let (node, _) = ProbeNode::constant(
            registry,
            config.name.as_deref(),
            json!("hi"),
            Duration::ZERO,
        );
        Ok(node)
    });
    let root = registry
        .load_workflow(
            r#"{"class_name": "SequentialExecution", "nodes": [
                {"class_name": "Greeting", "name": "greet"}
            ]}"#,
        )
        .unwrap();
    assert_eq!(root.call(&Context::new()).await.unwrap(), json!("hi"));
    assert!(registry.contains("greet"));
}
