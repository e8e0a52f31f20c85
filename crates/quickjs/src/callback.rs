//! Python callables exposed to script code.
//!
//! A registered callable lives in the runtime's [`Registry`] and is reached
//! from script through a native function whose closure owns a
//! [`Registration`]. The engine finalizes that closure when the function is
//! collected, which releases the registry slot.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use pyo3::{prelude::*, types::PyTuple};
use rquickjs::{
    Ctx, Exception, Function, Persistent, Value,
    function::{Constructor, Rest},
};

use crate::{
    bridge::{Bridged, HostValue},
    error::{Error, Result},
    execution::EngineRef,
    runtime::Shared,
};

/// Non-enumerable property carrying the id of the Python error a script
/// exception echoes.
pub(crate) const HOST_ERROR_KEY: &str = "__pythonErrorId";

/// Hard cap on the number of callables ever registered with one runtime.
pub(crate) const MAX_CALLABLES: usize = u16::MAX as usize;

const ERROR_CLASS: &str = r#"(() => {
    class PythonError extends Error {
        constructor(message, id) {
            super(message);
            this.name = "PythonError";
            Object.defineProperty(this, "__pythonErrorId", { value: id });
        }
    }
    Object.defineProperty(globalThis, "PythonError", {
        value: PythonError,
        writable: true,
        configurable: true,
    });
    return PythonError;
})()"#;

/// Slots for registered callables. Released slots are tombstoned and never
/// handed out again.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Option<Py<PyAny>>>,
}

impl Registry {
    pub(crate) fn insert(&mut self, callable: Py<PyAny>) -> Result<usize> {
        if self.slots.len() >= MAX_CALLABLES {
            return Err(Error::SlotsExhausted);
        }
        self.slots.push(Some(callable));
        Ok(self.slots.len() - 1)
    }

    pub(crate) fn get(&self, py: Python<'_>, slot: usize) -> Option<Py<PyAny>> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(|callable| callable.clone_ref(py))
    }

    pub(crate) fn release(&mut self, slot: usize) -> Option<Py<PyAny>> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Empties every live slot. The caller drops the result outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<Py<PyAny>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Py<PyAny>> {
        self.slots.iter().flatten()
    }

    pub(crate) fn live(&self) -> usize {
        self.iter().count()
    }
}

/// Python exceptions raised by callables, keyed by the id stored on the
/// script exception that carries them.
#[derive(Default)]
pub(crate) struct HostErrors {
    inner: Mutex<(u32, HashMap<u32, PyErr>)>,
}

impl HostErrors {
    pub(crate) fn insert(&self, err: PyErr) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.0;
        inner.0 = inner.0.wrapping_add(1);
        inner.1.insert(id, err);
        id
    }

    pub(crate) fn take(&self, id: u32) -> Option<PyErr> {
        self.inner.lock().1.remove(&id)
    }

    /// Echoes that script code caught and never rethrew to the host.
    pub(crate) fn drain(&self) -> Vec<PyErr> {
        self.inner.lock().1.drain().map(|(_, err)| err).collect()
    }
}

enum CallFailure {
    Raised { err: PyErr, message: String },
    Unsupported(String),
}

impl From<PyErr> for CallFailure {
    fn from(err: PyErr) -> Self {
        let message = format!("Python call failed: {err}");
        Self::Raised { err, message }
    }
}

/// Owned by the native function wrapping one registered callable.
pub(crate) struct Registration {
    shared: Arc<Shared>,
    slot: usize,
}

impl Registration {
    pub(crate) const fn new(shared: Arc<Shared>, slot: usize) -> Self {
        Self { shared, slot }
    }

    fn invoke<'js>(&self, ctx: &Ctx<'js>, args: Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> {
        let execution = &self.shared.execution;
        if execution.deadline_armed() {
            return Err(Exception::throw_type(
                ctx,
                "Can not call into Python with a time limit set.",
            ));
        }

        let args = args
            .into_iter()
            .map(|arg| Bridged::from_js(ctx, arg))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| Exception::throw_internal(ctx, &err.to_string()))?;

        let phase = execution.suspend();
        let outcome = Python::attach(|py| self.call_host(py, args));
        execution.resume(phase);

        match outcome {
            Ok(value) => value.to_js(ctx),
            Err(CallFailure::Unsupported(message)) => Err(Exception::throw_type(ctx, &message)),
            Err(CallFailure::Raised { err, message }) => {
                let id = self.shared.echoes.insert(err);
                let class = self
                    .shared
                    .error_class
                    .lock()
                    .clone()
                    .ok_or_else(|| Exception::throw_internal(ctx, &message))?;
                let error: Value<'js> = class.into_inner().restore(ctx)?.construct((message, id))?;
                Err(ctx.throw(error))
            }
        }
    }

    fn call_host(&self, py: Python<'_>, args: Vec<Bridged>) -> Result<HostValue, CallFailure> {
        let callable = self.shared.registry.lock().get(py, self.slot).ok_or_else(|| {
            CallFailure::Unsupported("Python callable has been released.".to_owned())
        })?;

        let runtime = self.shared.execution.runtime(py).ok_or_else(|| {
            CallFailure::Unsupported("Runtime is not executing.".to_owned())
        })?;
        let args = args
            .into_iter()
            .map(|arg| arg.into_py(py, &runtime))
            .collect::<PyResult<Vec<_>>>()?;
        let args = PyTuple::new(py, args)?;

        let result = callable.bind(py).call1(args).map_err(|err| {
            tracing::debug!(slot = self.slot, error = %err, "python callable raised");
            CallFailure::from(err)
        })?;

        HostValue::extract(&result, self.shared.id).map_err(|err| match err {
            Error::Host(err) => CallFailure::from(err),
            other => CallFailure::Unsupported(other.to_string()),
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let phase = self.shared.execution.suspend();
        Python::attach(|_| {
            let released = self.shared.registry.lock().release(self.slot);
            drop(released);
        });
        self.shared.execution.resume(phase);
        tracing::debug!(slot = self.slot, "python callable finalized");
    }
}

/// Installs `registration` as the global `name`.
pub(crate) fn install<'js>(ctx: &Ctx<'js>, name: &str, registration: Registration) -> Result<()> {
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| registration.invoke(&ctx, args.0),
    )
    .and_then(|function| function.with_name(name))
    .map_err(|err| Error::Internal(err.to_string()))?;

    ctx.globals().set(name, function).map_err(|_| {
        drop(ctx.catch());
        Error::InstallCallable
    })
}

/// Defines the `PythonError` class used to carry Python exceptions through
/// script code.
pub(crate) fn install_error_class(
    ctx: &Ctx<'_>,
) -> rquickjs::Result<EngineRef<Constructor<'static>>> {
    let class: Constructor<'_> = ctx.eval(ERROR_CLASS)?;
    Ok(EngineRef::new(Persistent::save(ctx, class)))
}
