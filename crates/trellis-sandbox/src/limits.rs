//! Per-statement resource bounds enforced from inside the interpreter.
//!
//! Steps and call depth are counted by a C-level trace function, which
//! keeps tracing installed when it raises. Allocation size is bounded by
//! hook allocators wrapped around CPython's own. Both read thread-local
//! state, so concurrent sandboxes on different threads do not interfere.

use std::cell::{Cell, RefCell};
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Once;

use pyo3::exceptions::{PyRecursionError, PyTimeoutError};
use pyo3::ffi;
use pyo3::prelude::*;

pub(crate) const STEPS_EXHAUSTED: &str = "execution step budget exhausted";
pub(crate) const DEPTH_EXCEEDED: &str = "maximum call depth exceeded";
pub(crate) const ALLOCATION_REFUSED: &str = "allocation exceeds the sandbox limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exhausted {
    Steps,
    Depth,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    steps: u64,
    depth: usize,
    max_steps: u64,
    max_depth: usize,
    exhausted: Option<Exhausted>,
}

thread_local! {
    static COUNTERS: RefCell<Option<Counters>> = const { RefCell::new(None) };
    static ALLOC_LIMIT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Step and depth budget for one top-level statement. Tracing stays on
/// until the guard drops.
pub(crate) struct Budget {
    previous: Option<Counters>,
}

impl Budget {
    pub(crate) fn enter(_py: Python<'_>, max_steps: u64, max_depth: usize) -> Self {
        let counters = Counters {
            steps: 0,
            depth: 0,
            max_steps,
            max_depth,
            exhausted: None,
        };
        let previous = COUNTERS.with(|c| c.borrow_mut().replace(counters));
        // SAFETY: the GIL is held, as witnessed by `_py`.
        unsafe { ffi::PyEval_SetTrace(Some(trace), ptr::null_mut()) };
        Self { previous }
    }

    /// Which bound, if any, the statement ran into.
    pub(crate) fn exhausted(&self) -> Option<Exhausted> {
        COUNTERS.with(|c| c.borrow().and_then(|c| c.exhausted))
    }

    pub(crate) fn steps(&self) -> u64 {
        COUNTERS.with(|c| c.borrow().map(|c| c.steps).unwrap_or(0))
    }
}

impl Drop for Budget {
    fn drop(&mut self) {
        let restore = self.previous.take();
        let nested = restore.is_some();
        COUNTERS.with(|c| *c.borrow_mut() = restore);
        // SAFETY: guards are created and dropped under the GIL.
        unsafe {
            if nested {
                ffi::PyEval_SetTrace(Some(trace), ptr::null_mut());
            } else {
                ffi::PyEval_SetTrace(None, ptr::null_mut());
            }
        }
    }
}

unsafe extern "C" fn trace(
    _obj: *mut ffi::PyObject,
    _frame: *mut ffi::PyFrameObject,
    what: c_int,
    _arg: *mut ffi::PyObject,
) -> c_int {
    let tripped = COUNTERS.with(|cell| {
        let mut guard = cell.borrow_mut();
        let counters = guard.as_mut()?;
        match what {
            ffi::PyTrace_CALL => {
                counters.depth += 1;
                if counters.depth > counters.max_depth {
                    counters.exhausted.get_or_insert(Exhausted::Depth);
                    return Some(Exhausted::Depth);
                }
            }
            ffi::PyTrace_RETURN => counters.depth = counters.depth.saturating_sub(1),
            ffi::PyTrace_LINE => {
                counters.steps += 1;
                if counters.exhausted == Some(Exhausted::Steps) || counters.steps > counters.max_steps {
                    counters.exhausted = Some(Exhausted::Steps);
                    return Some(Exhausted::Steps);
                }
            }
            _ => {}
        }
        None
    });
    match tripped {
        None => 0,
        Some(kind) => {
            // SAFETY: trace functions are only called with the GIL held.
            let py = unsafe { Python::assume_gil_acquired() };
            let err = match kind {
                Exhausted::Steps => PyTimeoutError::new_err(STEPS_EXHAUSTED),
                Exhausted::Depth => PyRecursionError::new_err(DEPTH_EXCEEDED),
            };
            err.restore(py);
            -1
        }
    }
}

/// Caps the size of any single interpreter allocation on this thread
/// until dropped.
pub(crate) struct AllocationLimit {
    previous: usize,
}

impl AllocationLimit {
    pub(crate) fn enter(py: Python<'_>, max_bytes: usize) -> Self {
        install_hooks(py);
        let previous = ALLOC_LIMIT.with(|limit| limit.replace(max_bytes.max(1)));
        Self { previous }
    }
}

impl Drop for AllocationLimit {
    fn drop(&mut self) {
        ALLOC_LIMIT.with(|limit| limit.set(self.previous));
    }
}

fn allowed(size: usize) -> bool {
    ALLOC_LIMIT.try_with(|limit| size <= limit.get()).unwrap_or(true)
}

fn install_hooks(_py: Python<'_>) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        for domain in [
            ffi::PyMemAllocatorDomain::PYMEM_DOMAIN_MEM,
            ffi::PyMemAllocatorDomain::PYMEM_DOMAIN_OBJ,
        ] {
            // SAFETY: hooks that wrap the current allocator may be installed
            // after initialisation while the GIL is held.
            unsafe {
                let mut original = ffi::PyMemAllocatorEx {
                    ctx: ptr::null_mut(),
                    malloc: None,
                    calloc: None,
                    realloc: None,
                    free: None,
                };
                ffi::PyMem_GetAllocator(domain, &mut original);
                let ctx = Box::into_raw(Box::new(original)) as *mut c_void;
                let mut hooked = ffi::PyMemAllocatorEx {
                    ctx,
                    malloc: Some(hook_malloc),
                    calloc: Some(hook_calloc),
                    realloc: Some(hook_realloc),
                    free: Some(hook_free),
                };
                ffi::PyMem_SetAllocator(domain, &mut hooked);
            }
        }
    });
}

fn original<'a>(ctx: *mut c_void) -> &'a ffi::PyMemAllocatorEx {
    // SAFETY: `ctx` is the leaked box created in `install_hooks`.
    unsafe { &*(ctx as *const ffi::PyMemAllocatorEx) }
}

extern "C" fn hook_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    if !allowed(size) {
        return ptr::null_mut();
    }
    let inner = original(ctx);
    match inner.malloc {
        Some(malloc) => unsafe { malloc(inner.ctx, size) },
        None => ptr::null_mut(),
    }
}

extern "C" fn hook_calloc(ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    if !allowed(nelem.saturating_mul(elsize)) {
        return ptr::null_mut();
    }
    let inner = original(ctx);
    match inner.calloc {
        Some(calloc) => unsafe { calloc(inner.ctx, nelem, elsize) },
        None => ptr::null_mut(),
    }
}

extern "C" fn hook_realloc(ctx: *mut c_void, block: *mut c_void, size: usize) -> *mut c_void {
    if !allowed(size) {
        return ptr::null_mut();
    }
    let inner = original(ctx);
    match inner.realloc {
        Some(realloc) => unsafe { realloc(inner.ctx, block, size) },
        None => ptr::null_mut(),
    }
}

extern "C" fn hook_free(ctx: *mut c_void, block: *mut c_void) {
    let inner = original(ctx);
    if let Some(free) = inner.free {
        unsafe { free(inner.ctx, block) }
    }
}
