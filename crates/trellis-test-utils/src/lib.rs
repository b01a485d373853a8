//! Mocks and fixtures shared by the Trellis test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use trellis_core::{
    LanguageModel, ModelRequest, ModelResponse, Result, Tool, TrellisConfig, TrellisError,
};
use trellis_engine::{Context, Node, NodeBase, NodeRegistry};

/// Registry whose execution scopes use `workers` pool slots.
pub fn registry_with_workers(workers: usize) -> NodeRegistry {
    let mut config = TrellisConfig::default();
    config.engine.workers = Some(workers);
    NodeRegistry::new(config)
}

// ── Language model ──────────────────────────────────────────────

/// Language model replaying scripted answers.
///
/// Each answer is streamed word by word through the request manager and
/// generation stops as soon as the manager asks for it. Once the script is
/// exhausted the model answers with `default_answer`.
pub struct MockModel {
    name: String,
    script: Mutex<VecDeque<String>>,
    default_answer: String,
    chunk_delay: Duration,
    requests: Mutex<Vec<(String, ModelRequest)>>,
    chunks: AtomicUsize,
}

impl MockModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default_answer: "ok".into(),
            chunk_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            chunks: AtomicUsize::new(0),
        }
    }

    pub fn with_answers<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .lock()
            .unwrap()
            .extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn with_default_answer(mut self, answer: &str) -> Self {
        self.default_answer = answer.to_string();
        self
    }

    /// Pause between streamed chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// `(method, request)` pairs received so far.
    pub fn requests(&self) -> Vec<(String, ModelRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Chunks delivered to request managers across all calls.
    pub fn chunks_emitted(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, method: &str, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        let method = method.to_string();
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap()
                .push((method, request.clone()));
            let answer = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_answer.clone());

            let mut generated = String::new();
            for (i, word) in answer.split(' ').enumerate() {
                if request.is_aborted() {
                    break;
                }
                let chunk = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                generated.push_str(&chunk);
                self.chunks.fetch_add(1, Ordering::SeqCst);
                if !request.emit(&chunk) {
                    break;
                }
                if !self.chunk_delay.is_zero() {
                    tokio::time::sleep(self.chunk_delay).await;
                }
            }
            Ok(ModelResponse::predicted(generated))
        })
    }
}

// ── Tools ───────────────────────────────────────────────────────

type ToolFn = Box<dyn Fn(Vec<Value>, Map<String, Value>) -> Result<Value> + Send + Sync>;

/// Tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Vec<String>,
    accepts_any: bool,
    func: ToolFn,
}

impl FnTool {
    pub fn new(
        name: &str,
        parameters: &[&str],
        func: impl Fn(Vec<Value>, Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Test tool {name}"),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            accepts_any: false,
            func: Box::new(func),
        }
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn accepting_any(mut self) -> Self {
        self.accepts_any = true;
        self
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[String] {
        &self.parameters
    }

    fn accepts_any(&self) -> bool {
        self.accepts_any
    }

    fn invoke(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        (self.func)(args, kwargs)
    }
}

// ── Nodes ───────────────────────────────────────────────────────

/// Counters shared between a probe node and the test observing it.
#[derive(Debug, Default)]
pub struct Probe {
    runs: AtomicUsize,
    finished: AtomicUsize,
    interrupted: AtomicBool,
}

impl Probe {
    /// Times the node started running.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs that completed without being stopped.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether some run noticed a stop signal and gave up.
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Returns a fixed value, or the item found under `source_key`, after an
/// optional delay, recording each run.
///
/// While waiting the node polls its stop state; a stopped run returns
/// `null`. With `fail_on` set, inputs equal to it produce an error.
pub struct ProbeNode {
    base: NodeBase,
    output: ProbeOutput,
    delay: Duration,
    fail_on: Option<Value>,
    probe: Arc<Probe>,
}

enum ProbeOutput {
    Fixed(Value),
    Key(String),
}

const POLL: Duration = Duration::from_millis(2);

impl ProbeNode {
    /// Register a probe returning `value`.
    pub fn constant(
        registry: &NodeRegistry,
        name: Option<&str>,
        value: Value,
        delay: Duration,
    ) -> (Arc<dyn Node>, Arc<Probe>) {
        Self::register(registry, name, ProbeOutput::Fixed(value), delay, None)
    }

    /// Register a probe echoing the context value under `key`.
    pub fn echo(
        registry: &NodeRegistry,
        name: Option<&str>,
        key: &str,
        delay: Duration,
        fail_on: Option<Value>,
    ) -> (Arc<dyn Node>, Arc<Probe>) {
        Self::register(registry, name, ProbeOutput::Key(key.to_string()), delay, fail_on)
    }

    fn register(
        registry: &NodeRegistry,
        name: Option<&str>,
        output: ProbeOutput,
        delay: Duration,
        fail_on: Option<Value>,
    ) -> (Arc<dyn Node>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let shared = Arc::clone(&probe);
        let node = registry.insert_with("ProbeNode", name, move |base| ProbeNode {
            base,
            output,
            delay,
            fail_on,
            probe: shared,
        });
        (node, probe)
    }
}

impl Node for ProbeNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.probe.runs.fetch_add(1, Ordering::SeqCst);
            let value = match &self.output {
                ProbeOutput::Fixed(value) => value.clone(),
                ProbeOutput::Key(key) => ctx
                    .get(key)
                    .ok_or_else(|| TrellisError::MissingKey(key.clone()))?,
            };
            if !wait(&self.base, ctx, self.delay).await {
                self.probe.interrupted.store(true, Ordering::SeqCst);
                return Ok(Value::Null);
            }
            if self.fail_on.as_ref() == Some(&value) {
                return Err(TrellisError::Function {
                    name: self.base.name().to_string(),
                    message: format!("refusing {value}"),
                });
            }
            self.probe.finished.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }
}

/// Sleep for `delay` in small steps. Returns false when stopped first.
async fn wait(base: &NodeBase, ctx: &Context, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if base.is_stopped(ctx) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep(POLL.min(deadline - now)).await;
    }
}

/// Runs until stopped, counting the poll cycles it went through.
pub struct DelayNode {
    base: NodeBase,
    cycles: Arc<AtomicUsize>,
}

impl DelayNode {
    pub fn register(registry: &NodeRegistry, name: Option<&str>) -> (Arc<dyn Node>, Arc<AtomicUsize>) {
        let cycles = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&cycles);
        let node = registry.insert_with("DelayNode", name, move |base| DelayNode {
            base,
            cycles: shared,
        });
        (node, cycles)
    }
}

impl Node for DelayNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            while !self.base.is_stopped(ctx) {
                self.cycles.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(POLL).await;
            }
            Ok(Value::Null)
        })
    }
}
