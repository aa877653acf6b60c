//! In-memory [`FunctionRegistry`] backed by an insertion-ordered list.

use std::path::Path;

use chrono::Utc;
use fnhost_sandbox::validator::DEFAULT_MAX_CODE_SIZE;
use fnhost_sandbox::{FunctionSource, SourceError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{FunctionDefinition, FunctionUpdate, Language, NewFunction};
use crate::{FunctionRegistry, RegistryError};

/// Function registry held in process memory.
///
/// Lookups scan in registration order, so when an id of one definition
/// equals the name of another, the id match still wins.
pub struct InMemoryRegistry {
    definitions: RwLock<Vec<FunctionDefinition>>,
    max_code_size: usize,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Create an empty registry with the default code size limit.
    pub fn new() -> Self {
        Self::with_max_code_size(DEFAULT_MAX_CODE_SIZE)
    }

    /// Create an empty registry that rejects code larger than `max_code_size`.
    pub fn with_max_code_size(max_code_size: usize) -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            max_code_size,
        }
    }

    /// Seed a registry from a JSON array of registration requests.
    pub fn from_json(json: &str, max_code_size: usize) -> Result<Self, RegistryError> {
        let requests: Vec<NewFunction> = serde_json::from_str(json)?;
        let mut definitions = Vec::with_capacity(requests.len());
        for request in requests {
            let definition = build(request, max_code_size)?;
            ensure_unique(&definitions, &definition.name, None)?;
            definitions.push(definition);
        }
        tracing::debug!(count = definitions.len(), "function catalogue loaded");
        Ok(Self {
            definitions: RwLock::new(definitions),
            max_code_size,
        })
    }

    /// Seed a registry from a JSON catalogue file.
    pub async fn load_from_file(
        path: impl AsRef<Path>,
        max_code_size: usize,
    ) -> Result<Self, RegistryError> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json, max_code_size)
    }

    /// Number of stored definitions.
    pub async fn len(&self) -> usize {
        self.definitions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.definitions.read().await.is_empty()
    }
}

/// Validate and classify `code` for `callable`.
///
/// Only the embedded language is parsed for its shape; other languages are
/// stored as given and rejected when executed.
fn classify_source(
    code: &str,
    callable: &str,
    language: Language,
    max_code_size: usize,
) -> Result<FunctionSource, SourceError> {
    if language.is_embedded() {
        return FunctionSource::resolve(code, callable, Some(max_code_size));
    }
    if code.trim().is_empty() {
        return Err(SourceError::Empty);
    }
    if code.len() > max_code_size {
        return Err(SourceError::TooLarge {
            max: max_code_size,
            actual: code.len(),
        });
    }
    Ok(FunctionSource::FullDeclaration(code.to_string()))
}

fn build(new: NewFunction, max_code_size: usize) -> Result<FunctionDefinition, RegistryError> {
    let callable = new.entry_point.as_deref().unwrap_or(&new.name);
    let source = classify_source(&new.code, callable, new.language, max_code_size)?;
    let now = Utc::now();
    Ok(FunctionDefinition {
        id: Uuid::new_v4().to_string(),
        project_id: new.project_id,
        name: new.name,
        source,
        language: new.language,
        entry_point: new.entry_point,
        description: new.description,
        runtime: new.runtime,
        timeout: new.timeout,
        memory_limit: new.memory_limit,
        metadata: new.metadata.unwrap_or_default(),
        env_vars: new.env_vars.unwrap_or_default(),
        created_at: now,
        updated_at: now,
    })
}

fn ensure_unique(
    definitions: &[FunctionDefinition],
    name: &str,
    except_id: Option<&str>,
) -> Result<(), RegistryError> {
    let taken = definitions
        .iter()
        .any(|d| d.name == name && Some(d.id.as_str()) != except_id);
    if taken {
        return Err(RegistryError::DuplicateName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn not_found(id_or_name: &str) -> RegistryError {
    RegistryError::NotFound {
        id_or_name: id_or_name.to_string(),
    }
}

#[async_trait::async_trait]
impl FunctionRegistry for InMemoryRegistry {
    async fn get_definition(&self, id_or_name: &str) -> Result<FunctionDefinition, RegistryError> {
        let definitions = self.definitions.read().await;
        definitions
            .iter()
            .find(|d| d.id == id_or_name)
            .or_else(|| definitions.iter().find(|d| d.name == id_or_name))
            .cloned()
            .ok_or_else(|| not_found(id_or_name))
    }

    async fn get(&self, id: &str) -> Result<FunctionDefinition, RegistryError> {
        self.definitions
            .read()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn list_definitions(
        &self,
        project_id: &str,
    ) -> Result<Vec<FunctionDefinition>, RegistryError> {
        Ok(self
            .definitions
            .read()
            .await
            .iter()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create(&self, new: NewFunction) -> Result<FunctionDefinition, RegistryError> {
        let definition = build(new, self.max_code_size)?;
        let mut definitions = self.definitions.write().await;
        ensure_unique(&definitions, &definition.name, None)?;
        definitions.push(definition.clone());
        tracing::info!(
            id = %definition.id,
            name = %definition.name,
            language = %definition.language,
            statement_body = definition.source.is_statement_body(),
            "function registered"
        );
        Ok(definition)
    }

    async fn update(
        &self,
        id: &str,
        update: FunctionUpdate,
    ) -> Result<FunctionDefinition, RegistryError> {
        let mut definitions = self.definitions.write().await;
        if let Some(name) = &update.name {
            ensure_unique(&definitions, name, Some(id))?;
        }
        let index = definitions
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| not_found(id))?;

        // build the patched record first so a rejected update changes nothing
        let mut patched = definitions[index].clone();
        let reclassify = update.touches_source();
        let code = update.code.unwrap_or_else(|| patched.code().to_string());
        if let Some(name) = update.name {
            patched.name = name;
        }
        if update.entry_point.is_some() {
            patched.entry_point = update.entry_point;
        }
        if let Some(language) = update.language {
            patched.language = language;
        }
        if reclassify {
            patched.source =
                classify_source(&code, patched.callable(), patched.language, self.max_code_size)?;
        }
        if update.description.is_some() {
            patched.description = update.description;
        }
        if update.runtime.is_some() {
            patched.runtime = update.runtime;
        }
        if update.timeout.is_some() {
            patched.timeout = update.timeout;
        }
        if update.memory_limit.is_some() {
            patched.memory_limit = update.memory_limit;
        }
        if let Some(metadata) = update.metadata {
            patched.metadata = metadata;
        }
        if let Some(env_vars) = update.env_vars {
            patched.env_vars = env_vars;
        }
        patched.updated_at = Utc::now();

        definitions[index] = patched.clone();
        tracing::info!(id = %patched.id, name = %patched.name, "function updated");
        Ok(patched)
    }

    async fn delete(&self, id: &str) -> Result<FunctionDefinition, RegistryError> {
        let mut definitions = self.definitions.write().await;
        let index = definitions
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| not_found(id))?;
        let removed = definitions.remove(index);
        tracing::info!(id = %removed.id, name = %removed.name, "function deleted");
        Ok(removed)
    }

    async fn names(&self) -> Vec<String> {
        self.definitions
            .read()
            .await
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}
