//! Registration-time checks for function source and callable names.
//!
//! The V8 isolate is the real security boundary. These checks reject code
//! that can never work in the sandbox early, with a clearer message than the
//! engine would give.

use std::sync::LazyLock;

use regex::Regex;

use crate::source::SourceError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Patterns that are banned from function source. The sandbox has no module
/// loader and no runtime namespace, so these can only fail at run time.
const BANNED_PATTERNS: &[&str] = &[
    "Deno.",    // Runtime escape
    "import(",  // Dynamic imports
    "require(", // CommonJS
];

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static regex is valid")
});

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Validates function source before it is stored.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SourceError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SourceError::TooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SourceError::Empty);
    }

    for pattern in BANNED_PATTERNS {
        if code.contains(pattern) {
            return Err(SourceError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}

/// Checks that `name` can be used as a global function binding.
pub fn validate_callable(name: &str) -> Result<(), SourceError> {
    if !IDENTIFIER_RE.is_match(name) || RESERVED_WORDS.contains(&name) {
        return Err(SourceError::InvalidCallable {
            name: name.to_string(),
        });
    }
    Ok(())
}
