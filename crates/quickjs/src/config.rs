use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Resource limits applied to a runtime.
///
/// Every field is optional; an absent field leaves the current setting alone.
/// Accepted as keyword arguments by `Context(...)` and as a JSON document by
/// `Context.configure_json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Upper bound on engine allocations, in bytes.
    pub memory_limit: Option<usize>,
    /// Wall-clock budget per call in seconds. Negative disables the limit.
    pub time_limit: Option<f64>,
    /// Upper bound on the engine's native stack usage, in bytes.
    pub max_stack_size: Option<usize>,
}

impl RuntimeOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Validated form of [`Self::time_limit`]: `None` if unset, `Some(None)`
    /// to disable the limit.
    pub(crate) fn deadline(&self) -> Result<Option<Option<Duration>>> {
        self.time_limit.map(time_limit_from_secs).transpose()
    }
}

pub(crate) fn time_limit_from_secs(seconds: f64) -> Result<Option<Duration>> {
    if seconds < 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|e| Error::InvalidConfig(format!("time limit {seconds}: {e}")))
}
