//! Conversion between Python objects and script values.
//!
//! Each direction is split in two so that no Python object is touched
//! without the GIL and no engine value is touched without the engine lock:
//! [`HostValue`] is extracted with the GIL held and materialized inside the
//! engine, [`Bridged`] is captured inside the engine and turned into a Python
//! object once the GIL is back.

use pyo3::{
    IntoPyObjectExt,
    prelude::*,
    types::{PyBool, PyFloat, PyInt, PyString},
};
use rquickjs::{Ctx, Exception, Persistent, Type, Value, convert::Coerced, qjs};

use crate::{
    error::{Error, Result},
    execution::EngineRef,
    object::ScriptValue,
    runtime::Runtime,
};

/// A Python value validated for transfer into a runtime.
#[derive(Debug)]
pub(crate) enum HostValue {
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(String),
    Handle(Py<ScriptValue>),
}

impl HostValue {
    /// Validates `obj` for the runtime identified by `runtime_id`.
    pub(crate) fn extract(obj: &Bound<'_, PyAny>, runtime_id: u64) -> Result<Self> {
        if obj.is_none() {
            return Ok(Self::Null);
        }
        // bool is a subclass of int and has to be matched first.
        if obj.is_instance_of::<PyBool>() {
            return Ok(Self::Bool(obj.extract()?));
        }
        if obj.is_instance_of::<PyInt>() {
            return Self::extract_int(obj);
        }
        if obj.is_instance_of::<PyFloat>() {
            return Ok(Self::Float(obj.extract()?));
        }
        if obj.is_instance_of::<PyString>() {
            return Ok(Self::String(obj.extract()?));
        }
        if let Ok(handle) = obj.cast::<ScriptValue>() {
            let value = handle.get();
            if value.runtime_id() != runtime_id {
                return Err(Error::MixedRuntimes);
            }
            if value.is_released() {
                return Err(Error::Released);
            }
            return Ok(Self::Handle(handle.clone().unbind()));
        }

        let name = obj.get_type().name()?;
        Err(Error::UnsupportedType(name.to_string()))
    }

    #[allow(clippy::cast_precision_loss)]
    fn extract_int(obj: &Bound<'_, PyAny>) -> Result<Self> {
        if let Ok(value) = obj.extract::<i32>() {
            return Ok(Self::Int(value));
        }
        if let Ok(value) = obj.extract::<i64>() {
            return Ok(Self::Float(value as f64));
        }
        // Falls back to `float(obj)`, which raises instead of truncating.
        obj.extract::<f64>()
            .map(Self::Float)
            .map_err(|err| Error::IntegerOverflow(err.to_string()))
    }

    /// Validates every element of `args` before anything is converted.
    pub(crate) fn extract_all<'py>(
        args: impl IntoIterator<Item = Bound<'py, PyAny>>,
        runtime_id: u64,
    ) -> Result<Vec<Self>> {
        args.into_iter()
            .map(|arg| Self::extract(&arg, runtime_id))
            .collect()
    }

    pub(crate) fn to_js<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        Ok(match self {
            Self::Null => Value::new_null(ctx.clone()),
            Self::Bool(value) => Value::new_bool(ctx.clone(), *value),
            Self::Int(value) => Value::new_int(ctx.clone(), *value),
            Self::Float(value) => Value::new_float(ctx.clone(), *value),
            Self::String(value) => rquickjs::String::from_str(ctx.clone(), value)?.into_value(),
            Self::Handle(handle) => match handle.get().restore(ctx) {
                Some(value) => value?,
                None => return Err(Exception::throw_internal(ctx, &Error::Released.to_string())),
            },
        })
    }
}

/// A script value captured for transfer out of a runtime.
pub(crate) enum Bridged {
    Null,
    Bool(bool),
    Int(i32),
    /// Decimal digits of a `BigInt`.
    BigInt(String),
    Float(f64),
    String(String),
    Handle(EngineRef<Value<'static>>),
}

impl Bridged {
    pub(crate) fn from_js<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Self> {
        let bridged = match value.type_of() {
            Type::Undefined | Type::Null => Self::Null,
            Type::Bool => Self::Bool(value.as_bool().unwrap_or_default()),
            Type::Int => Self::Int(value.as_int().unwrap_or_default()),
            Type::Float => Self::Float(value.as_float().unwrap_or_default()),
            Type::String => Self::String(
                value
                    .get::<String>()
                    .map_err(|err| Error::Internal(err.to_string()))?,
            ),
            Type::BigInt => Self::BigInt(
                value
                    .get::<Coerced<String>>()
                    .map_err(|err| Error::Internal(err.to_string()))?
                    .0,
            ),
            kind if kind == Type::Module || value.is_object() || value.is_symbol() => {
                Self::Handle(EngineRef::new(Persistent::save(ctx, value)))
            }
            _ => {
                // SAFETY: reads the tag bits of a value owned by this frame.
                let tag = unsafe { qjs::JS_VALUE_GET_TAG(value.as_raw()) };
                return Err(Error::Internal(format!("Unknown quickjs tag: {tag}")));
            }
        };
        Ok(bridged)
    }

    /// Builds the Python object. Handles are bound to `runtime`.
    pub(crate) fn into_py(self, py: Python<'_>, runtime: &Py<Runtime>) -> PyResult<Py<PyAny>> {
        match self {
            Self::Null => Ok(py.None()),
            Self::Bool(value) => value.into_py_any(py),
            Self::Int(value) => value.into_py_any(py),
            Self::BigInt(digits) => Ok(py.get_type::<PyInt>().call1((digits,))?.unbind()),
            Self::Float(value) => value.into_py_any(py),
            Self::String(value) => value.into_py_any(py),
            Self::Handle(value) => {
                let handle = ScriptValue::new(runtime.clone_ref(py), value);
                Ok(Py::new(py, handle)?.into_any())
            }
        }
    }
}
