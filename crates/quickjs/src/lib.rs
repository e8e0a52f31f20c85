//! Sandboxed QuickJS runtimes for Python.
//!
//! Each [`Runtime`] (`_quickjs.Context` in Python) owns one engine with a
//! single context. Values cross the boundary through a conversion layer that
//! copies primitives and wraps everything else in a [`ScriptValue`]
//! (`_quickjs.Object`), and Python callables can be exposed to script code.
//! Calls into the engine release the GIL and are bounded by optional time,
//! memory and stack limits.

mod bridge;
mod callback;
mod config;
mod error;
mod execution;
mod memory;
mod object;
mod runtime;

use pyo3::prelude::*;

pub use crate::{
    config::RuntimeOptions,
    error::{Error, JSException, PythonError, Result, ScriptError, StackOverflow},
    memory::MemoryStats,
    object::ScriptValue,
    runtime::Runtime,
};

#[pymodule]
pub fn _quickjs(py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add("JSException", py.get_type::<JSException>())?;
    module.add("StackOverflow", py.get_type::<StackOverflow>())?;
    module.add("PythonError", py.get_type::<PythonError>())?;

    module.add_class::<Runtime>()?;
    module.add_class::<ScriptValue>()?;
    module.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
