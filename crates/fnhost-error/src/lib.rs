//! Error taxonomy for the fnhost function execution engine.
//!
//! Provides [`ErrorKind`], the closed set of failure categories every layer
//! maps into, and [`ExecutionError`], a kind plus a human-readable message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories surfaced to callers of the execution engine.
///
/// Each kind maps to exactly one HTTP status code and one retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No function definition matches the requested id or name.
    NotFound,
    /// The definition's language is not the embedded one.
    UnsupportedLanguage,
    /// The function source failed to parse or evaluate.
    CompileError,
    /// The named callable is absent after evaluation.
    FunctionNotFound,
    /// An argument cannot be represented in the sandbox value model.
    ArgumentMarshalError,
    /// The sandbox raised an exception during the call.
    RuntimeError,
    /// A timeout, memory ceiling, or capacity limit was hit.
    ResourceExceeded,
    /// Unexpected internal failure. Always a bug, never caller-induced.
    HostFault,
}

impl ErrorKind {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
            Self::CompileError => "COMPILE_ERROR",
            Self::FunctionNotFound => "FUNCTION_NOT_FOUND",
            Self::ArgumentMarshalError => "ARGUMENT_MARSHAL_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::ResourceExceeded => "RESOURCE_EXCEEDED",
            Self::HostFault => "HOST_FAULT",
        }
    }

    /// HTTP status code reported for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::UnsupportedLanguage
            | Self::CompileError
            | Self::FunctionNotFound
            | Self::ArgumentMarshalError
            | Self::RuntimeError
            | Self::ResourceExceeded => 400,
            Self::HostFault => 500,
        }
    }

    /// Returns whether a caller may reasonably retry after this failure.
    ///
    /// Compile and runtime errors are properties of the submitted code and
    /// reproduce deterministically. Only resource exhaustion may clear up
    /// (after reducing work). Host faults are never safe to retry.
    pub fn retryable(&self) -> bool {
        match self {
            Self::ResourceExceeded => true,
            Self::NotFound
            | Self::UnsupportedLanguage
            | Self::CompileError
            | Self::FunctionNotFound
            | Self::ArgumentMarshalError
            | Self::RuntimeError
            | Self::HostFault => false,
        }
    }

    /// Snake-case label, used for log fields and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UnsupportedLanguage => "unsupported_language",
            Self::CompileError => "compile_error",
            Self::FunctionNotFound => "function_not_found",
            Self::ArgumentMarshalError => "argument_marshal_error",
            Self::RuntimeError => "runtime_error",
            Self::ResourceExceeded => "resource_exceeded",
            Self::HostFault => "host_fault",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified execution failure: one [`ErrorKind`] plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    /// The failure category.
    pub kind: ErrorKind,
    /// Human-readable description, safe to show to the caller.
    pub message: String,
}

impl ExecutionError {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error for an id or name that matched no stored definition.
    pub fn not_found(id_or_name: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("Function not found: {id_or_name}"),
        )
    }

    /// Error for an unexpected internal failure.
    ///
    /// The message passed here is for logs; callers only see a generic text.
    pub fn host_fault() -> Self {
        Self::new(ErrorKind::HostFault, "Function execution failed")
    }

    /// Convert to a structured JSON error body.
    ///
    /// Returns a JSON object with `error`, `code`, `statusCode`, `message`,
    /// `retryable`, and optionally `suggested_fix`. When `known_names` is
    /// provided and the error is [`ErrorKind::NotFound`], the closest
    /// registered function name (edit distance 3 or less) is suggested.
    pub fn to_structured_error(
        &self,
        requested: Option<&str>,
        known_names: Option<&[&str]>,
    ) -> serde_json::Value {
        let suggested_fix = match (self.kind, requested, known_names) {
            (ErrorKind::NotFound, Some(requested), Some(names)) => {
                find_similar_name(requested, names)
            }
            (ErrorKind::ResourceExceeded, _, _) => {
                Some("Retry with a smaller workload".to_string())
            }
            (ErrorKind::UnsupportedLanguage, _, _) => {
                Some("Register the function with language 'javascript'".to_string())
            }
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.kind.code(),
            "statusCode": self.kind.status_code(),
            "message": self.message,
            "retryable": self.kind.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest matching function name using Levenshtein distance.
fn find_similar_name(requested: &str, known_names: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for &name in known_names {
        let dist = strsim::levenshtein(requested, name);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, name));
        }
    }

    best.map(|(_, name)| format!("Did you mean '{name}'?"))
}

// Compile-time assertion: ExecutionError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ExecutionError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorKind; 8] = [
        ErrorKind::NotFound,
        ErrorKind::UnsupportedLanguage,
        ErrorKind::CompileError,
        ErrorKind::FunctionNotFound,
        ErrorKind::ArgumentMarshalError,
        ErrorKind::RuntimeError,
        ErrorKind::ResourceExceeded,
        ErrorKind::HostFault,
    ];

    #[test]
    fn status_codes_follow_boundary_contract() {
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::UnsupportedLanguage.status_code(), 400);
        assert_eq!(ErrorKind::CompileError.status_code(), 400);
        assert_eq!(ErrorKind::FunctionNotFound.status_code(), 400);
        assert_eq!(ErrorKind::ArgumentMarshalError.status_code(), 400);
        assert_eq!(ErrorKind::RuntimeError.status_code(), 400);
        assert_eq!(ErrorKind::ResourceExceeded.status_code(), 400);
        assert_eq!(ErrorKind::HostFault.status_code(), 500);
    }

    #[test]
    fn only_resource_exhaustion_is_retryable() {
        for kind in ALL {
            assert_eq!(
                kind.retryable(),
                kind == ErrorKind::ResourceExceeded,
                "unexpected retry policy for {kind}"
            );
        }
    }

    #[test]
    fn codes_are_unique() {
        let codes: std::collections::HashSet<_> = ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), ALL.len());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ExecutionError::new(ErrorKind::RuntimeError, "Error: boom");
        assert_eq!(err.to_string(), "runtime_error: Error: boom");
    }

    #[test]
    fn not_found_message_names_the_identifier() {
        let err = ExecutionError::not_found("missing");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "Function not found: missing");
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ArgumentMarshalError).unwrap();
        assert_eq!(json, "\"argument_marshal_error\"");
    }

    #[test]
    fn structured_error_suggests_similar_name() {
        let err = ExecutionError::not_found("ad");
        let names = ["add", "subtract"];
        let json = err.to_structured_error(Some("ad"), Some(&names));
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["statusCode"], 404);
        assert_eq!(json["retryable"], false);
        assert_eq!(json["suggested_fix"], "Did you mean 'add'?");
    }

    #[test]
    fn structured_error_skips_distant_names() {
        let err = ExecutionError::not_found("completelydifferent");
        let names = ["add"];
        let json = err.to_structured_error(Some("completelydifferent"), Some(&names));
        assert!(json.get("suggested_fix").is_none());
    }

    #[test]
    fn structured_error_for_resource_exceeded_is_retryable() {
        let err = ExecutionError::new(ErrorKind::ResourceExceeded, "timed out");
        let json = err.to_structured_error(None, None);
        assert_eq!(json["retryable"], true);
        assert!(json["suggested_fix"].is_string());
    }

    #[test]
    fn host_fault_message_is_generic() {
        let err = ExecutionError::host_fault();
        assert_eq!(err.kind.status_code(), 500);
        assert_eq!(err.message, "Function execution failed");
    }
}
