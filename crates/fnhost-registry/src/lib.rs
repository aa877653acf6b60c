#![warn(missing_docs)]

//! # fnhost-registry
//!
//! The function registry: stored [`FunctionDefinition`]s and the
//! [`FunctionRegistry`] boundary the execution engine reads from.
//!
//! Source classification happens here, once, when a definition is created
//! or its code, name, entry point or language changes. The engine never
//! re-inspects the code string.

pub mod memory;
pub mod model;

use fnhost_error::{ErrorKind, ExecutionError};
use fnhost_sandbox::SourceError;
use thiserror::Error;

pub use memory::InMemoryRegistry;
pub use model::{
    FunctionDefinition, FunctionMetadata, FunctionUpdate, Language, NewFunction, Permissions,
};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No definition matches the id or name.
    #[error("function not found: {id_or_name}")]
    NotFound {
        /// The id or name that was looked up.
        id_or_name: String,
    },

    /// Another definition already uses this name.
    #[error("a function named '{name}' already exists")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// The code or callable name was rejected.
    #[error("invalid function source: {0}")]
    InvalidSource(#[from] SourceError),

    /// Reading a catalogue file failed.
    #[error("failed to read function catalogue: {0}")]
    Io(#[from] std::io::Error),

    /// A catalogue file was not valid JSON.
    #[error("invalid function catalogue: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// The taxonomy kind for this error when it surfaces from execution.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidSource(_) => ErrorKind::CompileError,
            Self::DuplicateName { .. } | Self::Io(_) | Self::Json(_) => ErrorKind::HostFault,
        }
    }
}

impl From<RegistryError> for ExecutionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { id_or_name } => ExecutionError::not_found(&id_or_name),
            other if other.kind() == ErrorKind::HostFault => ExecutionError::host_fault(),
            other => ExecutionError::new(other.kind(), other.to_string()),
        }
    }
}

/// Read and write access to stored function definitions.
#[async_trait::async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Resolve by id, then by name. The first match wins.
    async fn get_definition(&self, id_or_name: &str) -> Result<FunctionDefinition, RegistryError>;

    /// Fetch by id only.
    async fn get(&self, id: &str) -> Result<FunctionDefinition, RegistryError>;

    /// All definitions owned by a project, in registration order.
    async fn list_definitions(
        &self,
        project_id: &str,
    ) -> Result<Vec<FunctionDefinition>, RegistryError>;

    /// Register a new function.
    async fn create(&self, new: NewFunction) -> Result<FunctionDefinition, RegistryError>;

    /// Apply a partial update.
    async fn update(
        &self,
        id: &str,
        update: FunctionUpdate,
    ) -> Result<FunctionDefinition, RegistryError>;

    /// Remove a definition and return it.
    async fn delete(&self, id: &str) -> Result<FunctionDefinition, RegistryError>;

    /// All registered names, used for "did you mean" suggestions.
    async fn names(&self) -> Vec<String>;
}
