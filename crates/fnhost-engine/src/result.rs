//! Request and result types at the engine boundary.

use fnhost_error::{ErrorKind, ExecutionError};
use fnhost_sandbox::DynamicValue;
use serde::{Deserialize, Serialize};

/// Arguments for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Positional arguments, passed to the callable in order.
    #[serde(default)]
    pub args: Vec<DynamicValue>,
}

impl ExecutionRequest {
    /// Build a request from positional arguments.
    pub fn new(args: Vec<DynamicValue>) -> Self {
        Self { args }
    }
}

/// The tagged outcome of an execution. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The function returned a value.
    Success {
        /// The returned value.
        data: DynamicValue,
    },
    /// The execution failed.
    Failure {
        /// The failure category.
        kind: ErrorKind,
        /// Caller-visible description.
        message: String,
    },
}

impl ExecutionResult {
    /// Whether this is [`ExecutionResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure kind, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// HTTP status for this result.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Success { .. } => 200,
            Self::Failure { kind, .. } => kind.status_code(),
        }
    }

    /// Serialize as `{statusCode: 200, data}` or `{statusCode, message}`.
    pub fn to_response(&self) -> serde_json::Value {
        match self {
            Self::Success { data } => serde_json::json!({
                "statusCode": 200,
                "data": data,
            }),
            Self::Failure { message, .. } => serde_json::json!({
                "statusCode": self.status_code(),
                "message": message,
            }),
        }
    }

    /// Convert to a plain `Result`.
    pub fn into_result(self) -> Result<DynamicValue, ExecutionError> {
        match self {
            Self::Success { data } => Ok(data),
            Self::Failure { kind, message } => Err(ExecutionError::new(kind, message)),
        }
    }
}

impl From<Result<DynamicValue, ExecutionError>> for ExecutionResult {
    fn from(result: Result<DynamicValue, ExecutionError>) -> Self {
        match result {
            Ok(data) => Self::Success { data },
            Err(e) => Self::Failure {
                kind: e.kind,
                message: e.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_response_shape() {
        let result = ExecutionResult::Success {
            data: DynamicValue::from(json!({"sum": 5})),
        };
        assert_eq!(
            result.to_response(),
            json!({"statusCode": 200, "data": {"sum": 5}})
        );
    }

    #[test]
    fn failure_response_shape() {
        let result = ExecutionResult::from(Err(ExecutionError::not_found("ghost")));
        assert_eq!(result.status_code(), 404);
        assert_eq!(
            result.to_response(),
            json!({"statusCode": 404, "message": "Function not found: ghost"})
        );
        assert!(result.to_response().get("data").is_none());
    }

    #[test]
    fn host_fault_is_500() {
        let result = ExecutionResult::from(Err(ExecutionError::host_fault()));
        assert_eq!(result.to_response()["statusCode"], 500);
        assert_eq!(result.error_kind(), Some(ErrorKind::HostFault));
    }

    #[test]
    fn request_args_default_to_empty() {
        let req: ExecutionRequest = serde_json::from_value(json!({})).unwrap();
        assert!(req.args.is_empty());
        let req: ExecutionRequest =
            serde_json::from_value(json!({"args": [1, "a", null, [true]]})).unwrap();
        assert_eq!(req.args.len(), 4);
    }
}
