use std::{
    ptr::NonNull,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use pyo3::prelude::*;
use rquickjs::{Ctx, Persistent, qjs};

use crate::{memory::engine_runtime, runtime::Runtime};

/// A `JSContext` pointer captured while the engine lock is held.
pub(crate) struct RawContext(NonNull<qjs::JSContext>);

// SAFETY: only dereferenced on the thread recorded next to it in `Active`,
// while that thread still holds the engine lock.
unsafe impl Send for RawContext {}

impl RawContext {
    fn capture(ctx: &Ctx<'_>) -> Self {
        Self(ctx.as_raw())
    }

    /// # Safety
    ///
    /// The engine lock that was held when this was captured must still be held
    /// by the calling thread.
    pub(crate) unsafe fn restore<'js>(&self) -> Ctx<'js> {
        // SAFETY: guaranteed by the caller.
        unsafe { Ctx::from_raw(self.0) }
    }
}

/// A persistent engine value that may be carried across threads.
pub(crate) struct EngineRef<T>(Persistent<T>);

// SAFETY: the wrapped value is only restored, cloned or dropped inside
// `Runtime::execute`, with the engine lock of its runtime held.
unsafe impl<T> Send for EngineRef<T> {}
// SAFETY: as above; shared access never touches the engine outside the lock.
unsafe impl<T> Sync for EngineRef<T> {}

impl<T> EngineRef<T> {
    pub(crate) const fn new(value: Persistent<T>) -> Self {
        Self(value)
    }

    pub(crate) fn into_inner(self) -> Persistent<T> {
        self.0
    }
}

impl<T: Clone> Clone for EngineRef<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Script code is running; the GIL is released.
    Script,
    /// A host callable is running on top of the engine lock.
    Host,
}

struct Active {
    thread: ThreadId,
    ctx: RawContext,
    phase: Phase,
    runtime: Py<Runtime>,
}

/// Per-runtime record of the call currently inside the engine.
#[derive(Default)]
pub(crate) struct ExecutionState {
    time_limit: Mutex<Option<Duration>>,
    deadline: Mutex<Option<Instant>>,
    active: Mutex<Option<Active>>,
}

impl ExecutionState {
    pub(crate) fn set_time_limit(&self, limit: Option<Duration>) {
        *self.time_limit.lock() = limit;
    }

    /// Enters the outermost call. Must run with the engine lock held.
    pub(crate) fn begin(&self, ctx: &Ctx<'_>, runtime: Py<Runtime>) {
        // SAFETY: `ctx` is live and its runtime is locked by the caller.
        unsafe { qjs::JS_UpdateStackTop(engine_runtime(ctx)) };
        let limit = *self.time_limit.lock();
        *self.deadline.lock() = limit.map(|limit| Instant::now() + limit);
        let mut active = self.active.lock();
        debug_assert!(active.is_none(), "execution state entered twice");
        *active = Some(Active {
            thread: thread::current().id(),
            ctx: RawContext::capture(ctx),
            phase: Phase::Script,
            runtime,
        });
    }

    /// Leaves the outermost call and hands back the runtime reference so it
    /// can be dropped with the GIL held.
    pub(crate) fn end(&self) -> Option<Py<Runtime>> {
        *self.deadline.lock() = None;
        self.active.lock().take().map(|active| active.runtime)
    }

    /// Re-enters the engine from a host callable running on this thread.
    ///
    /// Returns the live context when the current thread owns the engine and
    /// is in the host phase; `None` means the caller must take the engine lock.
    pub(crate) fn reenter(&self) -> Option<RawContext> {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(active) if active.thread == thread::current().id() && active.phase == Phase::Host => {
                active.phase = Phase::Script;
                Some(RawContext(active.ctx.0))
            }
            _ => None,
        }
    }

    pub(crate) fn leave_reentry(&self) {
        if let Some(active) = self.active.lock().as_mut() {
            active.phase = Phase::Host;
        }
    }

    /// Marks the transition from script to a host callable.
    pub(crate) fn suspend(&self) -> Option<Phase> {
        self.active
            .lock()
            .as_mut()
            .map(|active| std::mem::replace(&mut active.phase, Phase::Host))
    }

    pub(crate) fn resume(&self, phase: Option<Phase>) {
        if let (Some(active), Some(phase)) = (self.active.lock().as_mut(), phase) {
            active.phase = phase;
        }
    }

    pub(crate) fn deadline_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    /// Polled by the engine's interrupt handler.
    pub(crate) fn deadline_passed(&self) -> bool {
        let passed = self
            .deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline);
        if passed {
            tracing::debug!("time limit exceeded, interrupting script");
        }
        passed
    }

    /// The runtime currently executing, for wrapping values handed to host
    /// callables.
    pub(crate) fn runtime(&self, py: Python<'_>) -> Option<Py<Runtime>> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.runtime.clone_ref(py))
    }
}
