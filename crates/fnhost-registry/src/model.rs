//! Function definition records and their registration payloads.

use chrono::{DateTime, Utc};
use fnhost_sandbox::FunctionSource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Source language of a function.
///
/// Only [`Language::Javascript`] runs in the embedded engine. Other values
/// can be registered but fail at execution time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// JavaScript, the embedded language.
    #[default]
    Javascript,
    /// TypeScript.
    Typescript,
    /// Python.
    Python,
}

impl Language {
    /// Whether the embedded engine can run this language.
    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::Javascript)
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Python => "python",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may see and run a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permissions {
    /// Visible outside the owning project.
    pub public: bool,
    /// Users explicitly allowed to execute.
    pub allowed_users: Vec<String>,
    /// Roles allowed to execute.
    pub execution_roles: Vec<String>,
}

/// Free-form descriptive metadata.
///
/// Unknown keys are kept as they were registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionMetadata {
    /// Search tags.
    pub tags: Vec<String>,
    /// Declared dependencies (informational only).
    pub dependencies: Vec<String>,
    /// Access flags.
    pub permissions: Permissions,
    /// Any other keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    /// UUID v4.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Unique name.
    pub name: String,
    /// Classified source code.
    pub source: FunctionSource,
    /// Source language.
    pub language: Language,
    /// Callable to invoke instead of `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Runtime label (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Requested timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Requested heap limit in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    /// Descriptive metadata.
    pub metadata: FunctionMetadata,
    /// Environment variables (stored, never exposed to the sandbox).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub env_vars: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl FunctionDefinition {
    /// The global binding called at execution: `entry_point`, else `name`.
    ///
    /// A declaration that defines `name` but not `entry_point` still runs;
    /// the engine falls back to `name` at lookup.
    pub fn callable(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(&self.name)
    }

    /// The source code as registered.
    pub fn code(&self) -> &str {
        self.source.code()
    }
}

/// Registration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFunction {
    /// Owning project.
    pub project_id: String,
    /// Unique name.
    pub name: String,
    /// Source code.
    pub code: String,
    /// Callable to invoke instead of `name`.
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Source language, `javascript` when omitted.
    #[serde(default)]
    pub language: Language,
    /// Runtime label.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Requested timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Requested heap limit in MiB.
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Metadata; the default shape when omitted.
    #[serde(default)]
    pub metadata: Option<FunctionMetadata>,
    /// Environment variables.
    #[serde(default)]
    pub env_vars: Option<Map<String, Value>>,
}

/// Partial update. `None` fields are left unchanged; fields mirror
/// [`NewFunction`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionUpdate {
    pub name: Option<String>,
    pub code: Option<String>,
    pub entry_point: Option<String>,
    pub description: Option<String>,
    pub language: Option<Language>,
    pub runtime: Option<String>,
    pub timeout: Option<u64>,
    pub memory_limit: Option<u64>,
    pub metadata: Option<FunctionMetadata>,
    pub env_vars: Option<Map<String, Value>>,
}

impl FunctionUpdate {
    /// Whether this update requires the source to be classified again.
    pub fn touches_source(&self) -> bool {
        self.name.is_some()
            || self.code.is_some()
            || self.entry_point.is_some()
            || self.language.is_some()
    }
}
