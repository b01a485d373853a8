use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::scope::ExecutionScope;

/// State shared by one top-level invocation and every fork taken from it.
#[derive(Default)]
struct Shared {
    aborted: AtomicBool,
    scope: Mutex<Option<Arc<ExecutionScope>>>,
}

/// Mutable key-value state threaded through a workflow run.
///
/// Cloning yields another handle to the same data. [`Context::fork`] copies
/// the data but keeps the abort flag, the execution scope and the stopper.
#[derive(Clone, Default)]
pub struct Context {
    data: Arc<Mutex<Map<String, Value>>>,
    shared: Arc<Shared>,
    stopper: Option<CancellationToken>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.lock().unwrap().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().remove(key)
    }

    /// Copy of the current data.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data.lock().unwrap().clone()
    }

    /// Overwrite keys with the entries of `other`.
    pub fn merge(&self, other: Map<String, Value>) {
        self.data.lock().unwrap().extend(other);
    }

    pub fn fork(&self) -> Self {
        Self {
            data: Arc::new(Mutex::new(self.snapshot())),
            shared: Arc::clone(&self.shared),
            stopper: self.stopper.clone(),
        }
    }

    /// Same data and scope, observed through an additional stop signal.
    pub fn with_stopper(mut self, stopper: CancellationToken) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn stopper(&self) -> Option<&CancellationToken> {
        self.stopper.as_ref()
    }

    /// Flag the whole run as aborted. Nodes not yet started are skipped.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Aborted, or the stopper installed by a racing parent fired.
    pub fn is_stopped(&self) -> bool {
        self.is_aborted() || self.stopper.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn scope(&self) -> Option<Arc<ExecutionScope>> {
        self.shared.scope.lock().unwrap().clone()
    }

    pub(crate) fn set_scope(&self, scope: Arc<ExecutionScope>) {
        *self.shared.scope.lock().unwrap() = Some(scope);
    }

    pub(crate) fn clear_scope(&self) {
        self.shared.scope.lock().unwrap().take();
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            data: Arc::new(Mutex::new(map)),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("data", &self.snapshot())
            .field("aborted", &self.is_aborted())
            .field("scope", &self.scope().map(|s| s.id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clone_shares_data() {
        let ctx = Context::new();
        let other = ctx.clone();
        other.insert("a", json!(1));
        assert_eq!(ctx.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_fork_copies_data_but_shares_abort() {
        let mut map = Map::new();
        map.insert("a".into(), json!(1));
        let ctx = Context::from(map);
        let fork = ctx.fork();
        fork.insert("a", json!(2));
        assert_eq!(ctx.get("a"), Some(json!(1)));

        fork.abort();
        assert!(ctx.is_aborted());
    }

    #[test]
    fn test_stopper_only_stops_its_holder() {
        let ctx = Context::new();
        let token = CancellationToken::new();
        let child = ctx.fork().with_stopper(token.clone());
        token.cancel();
        assert!(child.is_stopped());
        assert!(!ctx.is_stopped());
    }

    #[test]
    fn test_merge_overwrites() {
        let ctx = Context::new();
        ctx.insert("a", json!(1));
        let mut other = Map::new();
        other.insert("a".into(), json!(2));
        other.insert("b".into(), json!(3));
        ctx.merge(other);
        assert_eq!(ctx.snapshot(), *json!({"a": 2, "b": 3}).as_object().unwrap());
    }
}
