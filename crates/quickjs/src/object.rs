use parking_lot::Mutex;
use pyo3::{PyTraverseError, PyVisit, prelude::*, types::PyTuple};
use rquickjs::{Ctx, Value};

use crate::{
    bridge::HostValue,
    error::{Error, Result},
    execution::EngineRef,
    runtime::Runtime,
};

/// A non-primitive script value held from Python.
///
/// Keeps its runtime alive; the engine value is released before the runtime
/// reference when the handle is dropped.
#[pyclass(frozen, name = "Object", module = "_quickjs")]
pub struct ScriptValue {
    runtime: Py<Runtime>,
    value: Mutex<Option<EngineRef<Value<'static>>>>,
}

impl ScriptValue {
    pub(crate) fn new(runtime: Py<Runtime>, value: EngineRef<Value<'static>>) -> Self {
        Self {
            runtime,
            value: Mutex::new(Some(value)),
        }
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.runtime.get().id()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.value.lock().is_none()
    }

    /// The engine value, or `None` once released. Requires the engine lock.
    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>) -> Option<rquickjs::Result<Value<'js>>> {
        let value = self.value.lock().clone()?;
        Some(value.into_inner().restore(ctx))
    }

    /// Hands the engine value back to its runtime.
    fn release(&self, py: Python<'_>) {
        let Some(value) = self.value.lock().take() else {
            return;
        };
        Runtime::execute(&self.runtime, py, move |_, _| drop(value));
    }
}

#[pymethods]
impl ScriptValue {
    #[pyo3(signature = (*args))]
    fn __call__(slf: &Bound<'_, Self>, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
        Self::call(slf, args)
    }

    /// Calls this value as a function with `this` set to `undefined`.
    #[pyo3(signature = (*args))]
    fn call(slf: &Bound<'_, Self>, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        let this = slf.get();
        if this.is_released() {
            return Err(Error::Released.into());
        }
        let runtime = &this.runtime;
        let id = runtime.get().id();
        let function = HostValue::Handle(slf.clone().unbind());
        let args = HostValue::extract_all(args.iter(), id)?;
        Ok(Runtime::invoke(runtime, py, &function, &args)?)
    }

    /// `JSON.stringify` of the value. Values with no JSON form yield
    /// `"undefined"`.
    fn json(&self, py: Python<'_>) -> PyResult<String> {
        let json = Runtime::execute(&self.runtime, py, |ctx, shared| -> Result<Option<String>> {
            let value = self
                .restore(ctx)
                .ok_or(Error::Released)?
                .map_err(|err| shared.script_error(ctx, err))?;
            let json = ctx
                .json_stringify(value)
                .map_err(|err| shared.script_error(ctx, err))?;
            json.map(|json| json.to_string())
                .transpose()
                .map_err(|err| shared.script_error(ctx, err))
        })?;
        Ok(json.unwrap_or_else(|| "undefined".to_owned()))
    }

    fn __traverse__(&self, visit: PyVisit<'_>) -> Result<(), PyTraverseError> {
        visit.call(&self.runtime)
    }

    fn __clear__(&self) {
        Python::attach(|py| self.release(py));
    }
}

impl Drop for ScriptValue {
    fn drop(&mut self) {
        if self.value.get_mut().is_some() {
            Python::attach(|py| self.release(py));
        }
    }
}
