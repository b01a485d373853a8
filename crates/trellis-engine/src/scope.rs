use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;
use trellis_core::{Result, TrellisError};
use uuid::Uuid;

use crate::context::Context;

tokio::task_local! {
    /// Set while the current task runs atomic work under a permit.
    static HOLDS_PERMIT: ();
}

/// Bounded set of tasks spawned on behalf of one execution.
///
/// Only atomic node work holds a permit, wherever it runs: on a pool task
/// or inline inside a composite. Composite tasks merely wait on their
/// children, so nested fan-out never starves the pool.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawn `future` as a task of this pool. The task itself holds no
    /// permit; wrap atomic work in [`WorkerPool::bounded`].
    pub fn submit<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// Run `future` while holding a permit. Work already running under a
    /// permit on the same task reuses it instead of waiting for another.
    pub fn bounded<F>(&self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let permits = Arc::clone(&self.permits);
        async move {
            if HOLDS_PERMIT.try_with(|_| ()).is_ok() {
                return future.await;
            }
            let _permit = permits.acquire_owned().await.ok();
            HOLDS_PERMIT.scope((), future).await
        }
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Tasks submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    fn shutdown(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let mut aborted = 0;
        for task in tasks.into_iter().filter(|t| !t.is_finished()) {
            task.abort();
            aborted += 1;
        }
        aborted
    }
}

/// One top-level invocation: the root node and its lazily created pool.
pub struct ExecutionScope {
    id: String,
    root: String,
    workers: usize,
    pool: OnceLock<WorkerPool>,
}

impl ExecutionScope {
    pub fn new(root: impl Into<String>, workers: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            root: root.into(),
            workers,
            pool: OnceLock::new(),
        }
    }

    /// Install a fresh scope on `ctx`. Dropping the guard releases it.
    pub fn open(ctx: &Context, root: &str, workers: usize) -> ScopeGuard {
        let scope = Arc::new(Self::new(root, workers));
        debug!(scope = %scope.id, root, "opening execution scope");
        ctx.set_scope(Arc::clone(&scope));
        ScopeGuard {
            ctx: ctx.clone(),
            scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the node whose `start()` owns this scope.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn pool(&self) -> &WorkerPool {
        self.pool.get_or_init(|| {
            debug!(scope = %self.id, workers = self.workers, "creating worker pool");
            WorkerPool::new(self.workers)
        })
    }

    fn release(&self) {
        if let Some(pool) = self.pool.get() {
            let aborted = pool.shutdown();
            if aborted > 0 {
                debug!(scope = %self.id, aborted, "aborted outstanding tasks");
            }
        }
        debug!(scope = %self.id, root = %self.root, "released execution scope");
    }
}

/// Releases its scope on every exit path, unwinding included.
pub struct ScopeGuard {
    ctx: Context,
    scope: Arc<ExecutionScope>,
}

impl ScopeGuard {
    pub fn scope(&self) -> &Arc<ExecutionScope> {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.release();
        self.ctx.clear_scope();
    }
}

/// Await a pool task, surfacing panics and aborts as task errors.
pub async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|e| TrellisError::Task(e.to_string()))?
}
