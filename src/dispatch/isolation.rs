// =============================================================================
// Failure isolation for registered callbacks
// =============================================================================
//
// Handlers and detection methods are user code. An `Err` return and a panic
// are both contained here so one bad callback never stops a dispatch loop or
// the callbacks registered after it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

/// Why a callback did not complete.
#[derive(Debug)]
pub enum CallbackFailure {
    Error(anyhow::Error),
    Panic(String),
}

impl std::fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e:#}"),
            Self::Panic(msg) => write!(f, "panic: {msg}"),
        }
    }
}

/// Run `f`, converting both error returns and panics into [`CallbackFailure`].
pub fn call_isolated<T, F>(f: F) -> Result<T, CallbackFailure>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallbackFailure::Error(e)),
        Err(payload) => Err(CallbackFailure::Panic(panic_message(payload.as_ref()))),
    }
}

/// Run a handler for one record. Failures are logged with the record id and
/// handler name; returns whether the handler succeeded.
pub fn run_isolated<F>(kind: &str, record_id: &str, handler: &str, f: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match call_isolated(f) {
        Ok(()) => true,
        Err(failure) => {
            error!(
                kind,
                record_id,
                handler,
                error = %failure,
                "handler failed"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
