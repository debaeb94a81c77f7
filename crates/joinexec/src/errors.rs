use std::any::Any;

/// Errors produced by the join execution pipeline.
///
/// Cloneable so a single terminal error can ride the build-completion
/// signal to every waiting task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("worker panic: {0}")]
    WorkerPanic(String),

    #[error("spill error: {0}")]
    Spill(String),
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

impl ExecError {
    /// Convert a recovered panic payload into an error suitable for the
    /// normal error-reporting path.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> ExecError {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ExecError::WorkerPanic(msg)
    }
}

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::ExecError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;
