//! Function source classification.
//!
//! A stored code string is either a complete declaration or a bare statement
//! body. The distinction is made once, when the definition is registered or
//! its code changes, and is stored with the definition. Evaluation never
//! re-sniffs the code.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{validate_callable, validate_code};

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?function\b").expect("static regex is valid")
});

/// Reasons a code string cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The code is empty or whitespace.
    #[error("code is empty")]
    Empty,

    /// The code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    TooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned pattern was found.
    #[error("banned pattern detected: `{pattern}` (the sandbox has no module loader or runtime namespace)")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The callable name is not a usable JavaScript identifier.
    #[error("'{name}' is not a valid function name")]
    InvalidCallable {
        /// The rejected name.
        name: String,
    },

    /// A statement body declares the identifier it would be wrapped as.
    #[error("code declares '{name}' itself; register it as a full function declaration instead")]
    NameCollision {
        /// The colliding identifier.
        name: String,
    },
}

/// Stored function code, tagged with how it must be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FunctionSource {
    /// Statements to be wrapped as `function <callable>() { ... }`.
    StatementBody(String),
    /// A top-level `function` or `async function` declaration, evaluated as is.
    FullDeclaration(String),
}

impl FunctionSource {
    /// Classify `code` by its first token, without validation.
    pub fn classify(code: &str) -> Self {
        if DECLARATION_RE.is_match(code) {
            Self::FullDeclaration(code.to_string())
        } else {
            Self::StatementBody(code.to_string())
        }
    }

    /// Validate and classify `code` for the given callable name.
    pub fn resolve(
        code: &str,
        callable: &str,
        max_size: Option<usize>,
    ) -> Result<Self, SourceError> {
        validate_code(code, max_size)?;
        validate_callable(callable)?;

        let source = Self::classify(code);
        if let Self::StatementBody(body) = &source {
            if declares(body, callable) {
                return Err(SourceError::NameCollision {
                    name: callable.to_string(),
                });
            }
        }
        Ok(source)
    }

    /// The code as registered.
    pub fn code(&self) -> &str {
        match self {
            Self::StatementBody(code) | Self::FullDeclaration(code) => code,
        }
    }

    /// Script text to evaluate so that `callable` becomes a global function.
    pub fn render(&self, callable: &str) -> Cow<'_, str> {
        match self {
            Self::FullDeclaration(code) => Cow::Borrowed(code),
            // newline before the closing brace so a trailing line comment
            // cannot swallow it
            Self::StatementBody(body) => Cow::Owned(format!("function {callable}() {{\n{body}\n}}")),
        }
    }

    /// Returns `true` for [`FunctionSource::StatementBody`].
    pub fn is_statement_body(&self) -> bool {
        matches!(self, Self::StatementBody(_))
    }
}

fn declares(body: &str, name: &str) -> bool {
    let pattern = format!(
        r"(?:^|[^\w$])(?:function\*?|let|const|var|class)\s+{}(?:[^\w$]|$)",
        regex::escape(name)
    );
    Regex::new(&pattern).is_ok_and(|re| re.is_match(body))
}
