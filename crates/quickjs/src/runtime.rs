use std::{
    ptr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use pyo3::{
    PyTraverseError, PyVisit,
    prelude::*,
    types::{PyDict, PyTuple},
};
use rquickjs::{
    Context, Ctx, Exception, Module, Value,
    context::EvalOptions,
    function::{Args, Constructor},
    qjs,
};

use crate::{
    bridge::{Bridged, HostValue},
    callback::{self, HostErrors, Registration, Registry},
    config::{RuntimeOptions, time_limit_from_secs},
    error::{Error, Result},
    execution::{EngineRef, ExecutionState},
    memory::{self, HostAllocator, MemoryStats},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// State reachable both from the Python object and from native functions
/// living inside the engine.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) execution: Arc<ExecutionState>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) echoes: HostErrors,
    pub(crate) error_class: Mutex<Option<EngineRef<Constructor<'static>>>>,
}

impl Shared {
    /// Translates the exception pending in `ctx`.
    pub(crate) fn catch(&self, ctx: &Ctx<'_>) -> Error {
        Error::from_js_catch(ctx, &self.echoes)
    }

    pub(crate) fn script_error(&self, ctx: &Ctx<'_>, err: rquickjs::Error) -> Error {
        Error::from_js(ctx, &self.echoes, err)
    }
}

/// One isolated engine runtime with its single context.
#[pyclass(frozen, weakref, name = "Context", module = "_quickjs")]
pub struct Runtime {
    // Field order is drop order: the context goes before its runtime.
    context: Context,
    #[allow(dead_code)] // owns the engine the context lives in
    runtime: rquickjs::Runtime,
    shared: Arc<Shared>,
}

impl Runtime {
    pub fn new(options: &RuntimeOptions) -> Result<Self> {
        let time_limit = options.deadline()?;

        let runtime = rquickjs::Runtime::new_with_alloc(HostAllocator)
            .map_err(|err| Error::Internal(err.to_string()))?;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = options.max_stack_size {
            runtime.set_max_stack_size(size);
        }

        let execution = Arc::new(ExecutionState::default());
        if let Some(limit) = time_limit {
            execution.set_time_limit(limit);
        }
        let interrupt = Arc::clone(&execution);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.deadline_passed())));

        let context = Context::full(&runtime).map_err(|err| Error::Internal(err.to_string()))?;
        let shared = Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            execution,
            registry: Mutex::new(Registry::default()),
            echoes: HostErrors::default(),
            error_class: Mutex::new(None),
        });

        let error_class = context.with(|ctx| {
            callback::install_error_class(&ctx).map_err(|err| shared.script_error(&ctx, err))
        })?;
        *shared.error_class.lock() = Some(error_class);

        tracing::debug!(runtime = shared.id, ?options, "runtime created");
        Ok(Self {
            context,
            runtime,
            shared,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Runs `f` inside the engine with the GIL released.
    ///
    /// The outermost call takes the engine lock and arms the time limit. A
    /// call made from a Python callable that script code invoked on this
    /// thread runs on the context that is already live.
    pub(crate) fn execute<F, R>(this: &Py<Self>, py: Python<'_>, f: F) -> R
    where
        F: for<'js> FnOnce(&Ctx<'js>, &Shared) -> R + Send,
        R: Send,
    {
        let runtime = this.get();
        let shared = &*runtime.shared;

        if let Some(raw) = shared.execution.reenter() {
            let result = py.detach(move || {
                // SAFETY: this thread owns the engine lock further up the stack.
                let ctx = unsafe { raw.restore() };
                f(&ctx, shared)
            });
            shared.execution.leave_reentry();
            return result;
        }

        let handle = this.clone_ref(py);
        let (result, handle) = py.detach(|| {
            runtime.context.with(|ctx| {
                shared.execution.begin(&ctx, handle);
                let result = f(&ctx, shared);
                (result, shared.execution.end())
            })
        });
        drop(handle);

        let stale = shared.echoes.drain();
        if !stale.is_empty() {
            tracing::debug!(
                runtime = shared.id,
                count = stale.len(),
                "discarding python errors caught by script"
            );
        }
        result
    }

    /// Runs `f` and converts the value it produces.
    fn evaluate<F>(this: &Py<Self>, py: Python<'_>, f: F) -> Result<Py<PyAny>>
    where
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<Value<'js>> + Send,
    {
        let bridged = Self::execute(this, py, |ctx, shared| {
            let value = f(ctx).map_err(|err| shared.script_error(ctx, err))?;
            Bridged::from_js(ctx, value)
        })?;
        Ok(bridged.into_py(py, this)?)
    }

    /// Calls `function` with `args`, both already validated for this runtime.
    pub(crate) fn invoke(
        this: &Py<Self>,
        py: Python<'_>,
        function: &HostValue,
        args: &[HostValue],
    ) -> Result<Py<PyAny>> {
        Self::evaluate(this, py, |ctx| {
            let function = function.to_js(ctx)?;
            let Some(function) = function.as_function() else {
                return Err(Exception::throw_type(ctx, "not a function"));
            };
            let mut call_args = Args::new(ctx.clone(), args.len());
            for arg in args {
                call_args.push_arg(arg.to_js(ctx)?)?;
            }
            function.call_arg(call_args)
        })
    }

    fn apply(this: &Py<Self>, py: Python<'_>, options: &RuntimeOptions) -> Result<()> {
        let time_limit = options.deadline()?;
        let (memory_limit, max_stack_size) = (options.memory_limit, options.max_stack_size);
        Self::execute(this, py, |ctx, _| {
            if let Some(limit) = memory_limit {
                memory::set_memory_limit(ctx, limit);
            }
            if let Some(size) = max_stack_size {
                memory::set_max_stack_size(ctx, size);
            }
        });
        if let Some(limit) = time_limit {
            this.get().shared.execution.set_time_limit(limit);
        }
        tracing::debug!(runtime = this.get().id(), ?options, "runtime reconfigured");
        Ok(())
    }
}

#[pymethods]
impl Runtime {
    #[new]
    #[pyo3(signature = (*, memory_limit = None, time_limit = None, max_stack_size = None))]
    fn py_new(
        memory_limit: Option<usize>,
        time_limit: Option<f64>,
        max_stack_size: Option<usize>,
    ) -> PyResult<Self> {
        let options = RuntimeOptions {
            memory_limit,
            time_limit,
            max_stack_size,
        };
        Ok(Self::new(&options)?)
    }

    /// Evaluates `code` as a global script and returns its completion value.
    fn eval(slf: &Bound<'_, Self>, code: &str) -> PyResult<Py<PyAny>> {
        Ok(Self::evaluate(slf.as_unbound(), slf.py(), |ctx| {
            let mut options = EvalOptions::default();
            options.strict = false;
            ctx.eval_with_options(code, options)
        })?)
    }

    /// Evaluates `code` as an ES module.
    ///
    /// Returns the settled result of the evaluation, or the pending promise
    /// when the module is still awaiting.
    fn module(slf: &Bound<'_, Self>, code: &str) -> PyResult<Py<PyAny>> {
        Ok(Self::evaluate(slf.as_unbound(), slf.py(), |ctx| {
            let promise = Module::evaluate(ctx.clone(), "<module>", code)?;
            match promise.result::<Value<'_>>() {
                Some(result) => result,
                None => Ok(promise.into_value()),
            }
        })?)
    }

    fn parse_json(slf: &Bound<'_, Self>, json: &str) -> PyResult<Py<PyAny>> {
        Ok(Self::evaluate(slf.as_unbound(), slf.py(), |ctx| {
            ctx.json_parse(json)
        })?)
    }

    /// Reads the global `name`. Missing globals read as `None`.
    fn get(slf: &Bound<'_, Self>, name: &str) -> PyResult<Py<PyAny>> {
        Ok(Self::evaluate(slf.as_unbound(), slf.py(), |ctx| {
            ctx.globals().get(name)
        })?)
    }

    fn set(slf: &Bound<'_, Self>, name: &str, value: &Bound<'_, PyAny>) -> PyResult<()> {
        let value = HostValue::extract(value, slf.get().id())?;
        Self::execute(slf.as_unbound(), slf.py(), |ctx, shared| {
            let value = value
                .to_js(ctx)
                .map_err(|err| shared.script_error(ctx, err))?;
            ctx.globals()
                .set(name, value)
                .map_err(|err| shared.script_error(ctx, err))
        })?;
        Ok(())
    }

    #[pyo3(signature = (function, *args))]
    fn call(
        slf: &Bound<'_, Self>,
        function: &Bound<'_, PyAny>,
        args: &Bound<'_, PyTuple>,
    ) -> PyResult<Py<PyAny>> {
        let id = slf.get().id();
        let function = HostValue::extract(function, id)?;
        let args = HostValue::extract_all(args.iter(), id)?;
        Ok(Self::invoke(slf.as_unbound(), slf.py(), &function, &args)?)
    }

    /// Exposes `callable` to script code as the global function `name`.
    fn add_callable(slf: &Bound<'_, Self>, name: &str, callable: &Bound<'_, PyAny>) -> PyResult<()> {
        if !callable.is_callable() {
            return Err(Error::NotCallable.into());
        }
        let shared = Arc::clone(&slf.get().shared);
        let slot = shared.registry.lock().insert(callable.clone().unbind())?;
        let runtime = shared.id;

        Self::execute(slf.as_unbound(), slf.py(), move |ctx, _| {
            callback::install(ctx, name, Registration::new(shared, slot))
        })?;
        tracing::debug!(runtime, name, slot, "python callable registered");
        Ok(())
    }

    /// Runs one queued job. Returns whether a job was run.
    fn execute_pending_job(slf: &Bound<'_, Self>) -> PyResult<bool> {
        let executed = Self::execute(slf.as_unbound(), slf.py(), |ctx, shared| {
            let mut job_ctx = ptr::null_mut();
            // SAFETY: the runtime is locked; `job_ctx` is only written by the engine.
            let status =
                unsafe { qjs::JS_ExecutePendingJob(memory::engine_runtime(ctx), &raw mut job_ctx) };
            if status < 0 {
                Err(shared.catch(ctx))
            } else {
                Ok(status > 0)
            }
        })?;
        Ok(executed)
    }

    fn set_memory_limit(slf: &Bound<'_, Self>, limit: usize) -> PyResult<()> {
        Self::execute(slf.as_unbound(), slf.py(), |ctx, _| {
            memory::set_memory_limit(ctx, limit);
        });
        Ok(())
    }

    /// Sets the wall-clock budget of each call in seconds. Negative disables it.
    fn set_time_limit(&self, limit: f64) -> PyResult<()> {
        self.shared
            .execution
            .set_time_limit(time_limit_from_secs(limit)?);
        Ok(())
    }

    fn set_max_stack_size(slf: &Bound<'_, Self>, size: usize) -> PyResult<()> {
        Self::execute(slf.as_unbound(), slf.py(), |ctx, _| {
            memory::set_max_stack_size(ctx, size);
        });
        Ok(())
    }

    fn memory<'py>(slf: &Bound<'py, Self>) -> PyResult<Bound<'py, PyDict>> {
        let stats = Self::execute(slf.as_unbound(), slf.py(), |ctx, _| {
            MemoryStats::snapshot(ctx)
        });
        stats.to_dict(slf.py())
    }

    /// Runs the engine's cycle collector.
    fn gc(slf: &Bound<'_, Self>) {
        Self::execute(slf.as_unbound(), slf.py(), |ctx, _| memory::run_gc(ctx));
    }

    /// Applies limits from a JSON document; absent fields are left unchanged.
    fn configure_json(slf: &Bound<'_, Self>, json: &str) -> PyResult<()> {
        let options = RuntimeOptions::from_json(json)?;
        Ok(Self::apply(slf.as_unbound(), slf.py(), &options)?)
    }

    fn __traverse__(&self, visit: PyVisit<'_>) -> Result<(), PyTraverseError> {
        if let Some(registry) = self.shared.registry.try_lock() {
            for callable in registry.iter() {
                visit.call(callable)?;
            }
        }
        Ok(())
    }

    fn __clear__(&self) {
        let callables = self.shared.registry.lock().clear();
        tracing::debug!(
            runtime = self.shared.id,
            count = callables.len(),
            "releasing python callables"
        );
        drop(callables);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let class = self.shared.error_class.lock().take();
        if let Some(class) = class {
            self.context.with(|_| drop(class));
        }
        tracing::debug!(
            runtime = self.shared.id,
            live_callables = self.shared.registry.lock().live(),
            "runtime dropped"
        );
    }
}
