use std::{any::Any, backtrace::Backtrace, fmt::Display, sync::Arc};

use thiserror::Error;

/// Error type shared by every part of the execution runtime.
///
/// It is `Clone` because the first error observed by an execution is handed to
/// every result stream of that execution.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The memory quota (or another capacity limit) was hit. Never wrapped.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A recovered panic or a broken invariant inside the runtime.
    #[error("{message}")]
    Internal { message: String, stack: Option<Arc<String>> },
    /// An operator failure surfaced through a per-edge transport.
    #[error("runtime error{}: {source}", .location.as_ref().map(|l| format!(" {}", l)).unwrap_or_default())]
    Runtime { location: Option<String>, source: Box<ExecError> },
    #[error("context canceled")]
    Cancelled,
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("{0}")]
    Operator(String),
}

impl ExecError {
    pub fn internal(message: impl Into<String>) -> ExecError {
        ExecError::Internal { message: message.into(), stack: None }
    }

    pub fn invalid(message: impl Display) -> ExecError {
        ExecError::Invalid(message.to_string())
    }

    pub fn operator(message: impl Display) -> ExecError {
        ExecError::Operator(message.to_string())
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, ExecError::ResourceExhausted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    /// Wraps the error with the source location of the operator that produced it.
    /// Capacity errors are passed through untouched so callers can still tell them apart.
    pub fn with_location(self, location: Option<String>) -> ExecError {
        match self {
            ExecError::ResourceExhausted(_) => self,
            err => ExecError::Runtime { location, source: Box::new(err) },
        }
    }

    /// The innermost error, skipping location wrappers.
    pub fn root_cause(&self) -> &ExecError {
        match self {
            ExecError::Runtime { source, .. } => source.root_cause(),
            err => err,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            ExecError::Internal { stack, .. } => stack.as_deref().map(|s| s.as_str()),
            ExecError::Runtime { source, .. } => source.stack(),
            _ => None,
        }
    }
}

/// Turns the payload of a caught panic into an error.
///
/// Resource exhaustion is kept as-is, everything else becomes an internal error
/// with the message `panic: <payload>` and the stack of the current thread.
pub fn from_panic(payload: Box<dyn Any + Send>) -> ExecError {
    let message = match payload.downcast::<ExecError>() {
        Ok(err) if err.is_resource_exhausted() => return *err,
        Ok(err) => err.to_string(),
        Err(payload) => match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(s) => s.to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        },
    };
    ExecError::Internal {
        message: format!("panic: {}", message),
        stack: Some(Arc::new(Backtrace::force_capture().to_string())),
    }
}
