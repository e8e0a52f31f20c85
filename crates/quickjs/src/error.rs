use std::fmt;

use pyo3::{
    PyErr, Python, create_exception,
    exceptions::{PyException, PyOverflowError, PyRuntimeError, PyTypeError, PyValueError},
};
use rquickjs::{Ctx, convert::Coerced};
use thiserror::Error;

use crate::callback::{HOST_ERROR_KEY, HostErrors};

create_exception!(
    _quickjs,
    JSException,
    PyException,
    "Raised when script code throws or is interrupted."
);
create_exception!(
    _quickjs,
    StackOverflow,
    JSException,
    "Raised when script code exhausts the configured stack."
);
create_exception!(
    _quickjs,
    PythonError,
    JSException,
    "A Python exception that propagated through script code; see `__cause__`."
);

/// Substrings the engine uses when a call exceeds the maximum stack size.
const STACK_OVERFLOW_MARKERS: [&str; 2] = ["stack overflow", "Maximum call stack size exceeded"];

/// Used when the engine cannot even turn its exception into a string.
const UNREPRESENTABLE: &str = "(Failed obtaining the exception message)";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported type when converting a Python object to quickjs: {0}.")]
    UnsupportedType(String),

    #[error("Can not mix JS objects from different contexts.")]
    MixedRuntimes,

    #[error("Python int too large to convert to a script number: {0}")]
    IntegerOverflow(String),

    #[error("Argument must be callable.")]
    NotCallable,

    #[error("Failed adding the callable.")]
    InstallCallable,

    #[error("Callables slots exhausted.")]
    SlotsExhausted,

    #[error("Object has been released from its context.")]
    Released,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Script(ScriptError),

    #[error(transparent)]
    Host(#[from] PyErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// An exception thrown inside the engine, captured while the engine lock was
/// still held.
#[derive(Debug)]
pub struct ScriptError {
    pub message: String,
    pub stack: Option<String>,
    /// Set when the exception echoes a Python error raised by a host callable.
    pub host: Option<PyErr>,
}

impl ScriptError {
    pub fn is_stack_overflow(&self) -> bool {
        STACK_OVERFLOW_MARKERS
            .iter()
            .any(|marker| self.message.contains(marker))
    }

    fn into_py_err(self) -> PyErr {
        let text = self.to_string();
        if let Some(cause) = self.host {
            let err = PythonError::new_err(text);
            Python::attach(|py| err.set_cause(py, Some(cause)));
            err
        } else if self.is_stack_overflow() {
            StackOverflow::new_err(text)
        } else {
            JSException::new_err(text)
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => write!(f, "{}\n{}", self.message, stack),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

impl Error {
    /// Takes the pending exception out of `ctx`.
    pub(crate) fn from_js_catch(ctx: &Ctx<'_>, echoes: &HostErrors) -> Self {
        let caught = ctx.catch();
        let message = caught.get::<Coerced<String>>().map_or_else(
            |_| {
                // Converting may itself have thrown; drop that exception too.
                drop(ctx.catch());
                UNREPRESENTABLE.to_owned()
            },
            |message| message.0,
        );

        let (stack, host) = caught.as_object().map_or((None, None), |obj| {
            let stack = obj
                .get::<_, Option<String>>("stack")
                .ok()
                .flatten()
                .filter(|stack| !stack.is_empty());
            let host = obj
                .get::<_, Option<u32>>(HOST_ERROR_KEY)
                .ok()
                .flatten()
                .and_then(|id| echoes.take(id));
            (stack, host)
        });

        Self::Script(ScriptError {
            message,
            stack,
            host,
        })
    }

    pub(crate) fn from_js(ctx: &Ctx<'_>, echoes: &HostErrors, err: rquickjs::Error) -> Self {
        if matches!(err, rquickjs::Error::Exception) {
            Self::from_js_catch(ctx, echoes)
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl From<Error> for PyErr {
    fn from(err: Error) -> Self {
        match err {
            Error::UnsupportedType(_) | Error::NotCallable | Error::InstallCallable => {
                PyTypeError::new_err(err.to_string())
            }
            Error::MixedRuntimes | Error::Released | Error::InvalidConfig(_) => {
                PyValueError::new_err(err.to_string())
            }
            Error::IntegerOverflow(_) => PyOverflowError::new_err(err.to_string()),
            Error::SlotsExhausted | Error::Internal(_) => PyRuntimeError::new_err(err.to_string()),
            Error::Script(script) => script.into_py_err(),
            Error::Host(err) => err,
        }
    }
}
