//! Error types for the fnhost sandbox.

use fnhost_error::{ErrorKind, ExecutionError};
use thiserror::Error;

use crate::marshal::MarshalError;
use crate::source::SourceError;

/// Errors that can occur while running a function in the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The function source failed to parse, or threw while being evaluated.
    #[error("compile error: {message}")]
    Compile {
        /// Engine-provided description.
        message: String,
    },

    /// The callable is absent (or not a function) after evaluation.
    #[error("function '{name}' is not defined")]
    FunctionNotFound {
        /// The callable name that was looked up.
        name: String,
    },

    /// An argument cannot be represented in the sandbox.
    #[error("argument {index} cannot be marshalled: {source}")]
    ArgumentMarshal {
        /// Zero-based argument position.
        index: usize,
        /// Underlying conversion failure.
        source: MarshalError,
    },

    /// A JavaScript exception escaped the call, or a returned promise was
    /// rejected or never settled.
    #[error("{message}")]
    JsError {
        /// The exception description.
        message: String,
    },

    /// The returned value cannot be represented on the host.
    #[error("result cannot be marshalled: {0}")]
    ResultMarshal(MarshalError),

    /// The code was rejected before it reached the engine.
    #[error("invalid function source: {0}")]
    InvalidSource(#[from] SourceError),

    /// Execution hit the wall-clock budget and was terminated.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Effective timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The V8 heap ceiling was reached and execution was terminated.
    #[error("memory limit of {limit_mb} MiB exceeded")]
    HeapLimitExceeded {
        /// Effective heap ceiling in MiB.
        limit_mb: usize,
    },

    /// The serialized result exceeds the output ceiling.
    #[error("result exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many invocations are already in flight.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Sandbox handles were still live when the context was released.
    #[error("{live} sandbox handle(s) still live at release")]
    HandleLeak {
        /// Number of undisposed handles.
        live: usize,
    },

    /// The context bootstrap script failed.
    #[error("sandbox bootstrap failed: {message}")]
    Bootstrap {
        /// Engine-provided description.
        message: String,
    },

    /// Generic host-side failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// The taxonomy kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile { .. } | Self::InvalidSource(_) => ErrorKind::CompileError,
            Self::FunctionNotFound { .. } => ErrorKind::FunctionNotFound,
            Self::ArgumentMarshal { .. } => ErrorKind::ArgumentMarshalError,
            Self::JsError { .. } | Self::ResultMarshal(_) => ErrorKind::RuntimeError,
            Self::Timeout { .. }
            | Self::HeapLimitExceeded { .. }
            | Self::OutputTooLarge { .. }
            | Self::ConcurrencyLimit { .. } => ErrorKind::ResourceExceeded,
            Self::HandleLeak { .. }
            | Self::Bootstrap { .. }
            | Self::Execution(_)
            | Self::Serialization(_) => ErrorKind::HostFault,
        }
    }
}

impl From<SandboxError> for ExecutionError {
    fn from(err: SandboxError) -> Self {
        match err.kind() {
            // internal detail stays in the logs
            ErrorKind::HostFault => ExecutionError::host_fault(),
            kind => ExecutionError::new(kind, err.to_string()),
        }
    }
}
