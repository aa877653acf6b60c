#![warn(missing_docs)]

//! # fnhost-engine
//!
//! The execution engine facade.
//!
//! [`ExecutionEngine::execute`] resolves a definition from the registry,
//! rejects languages the sandbox cannot run, hands the invocation to the
//! [`SandboxExecutor`] and maps every failure to exactly one
//! [`ErrorKind`]. Each call emits one audit entry and one log line.

pub mod result;

use std::sync::Arc;

use fnhost_error::{ErrorKind, ExecutionError};
use fnhost_registry::FunctionRegistry;
use fnhost_sandbox::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use fnhost_sandbox::{DynamicValue, InvocationSpec, KvCapability, KvStore, SandboxExecutor};

pub use result::{ExecutionRequest, ExecutionResult};

/// Runs registered functions in the sandbox.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<dyn FunctionRegistry>,
    executor: Arc<SandboxExecutor>,
    kv: Option<Arc<KvStore>>,
    audit: Arc<dyn AuditLogger>,
}

impl ExecutionEngine {
    /// Create an engine with no kv capability and no audit sink.
    pub fn new(registry: Arc<dyn FunctionRegistry>, executor: SandboxExecutor) -> Self {
        Self {
            registry,
            executor: Arc::new(executor),
            kv: None,
            audit: Arc::new(NoopAuditLogger),
        }
    }

    /// Inject a kv store. Each function sees only its project's namespace.
    pub fn with_kv(mut self, store: Arc<KvStore>) -> Self {
        self.kv = Some(store);
        self
    }

    /// Send audit entries to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// The backing registry.
    pub fn registry(&self) -> &Arc<dyn FunctionRegistry> {
        &self.registry
    }

    /// The sandbox executor.
    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Execute the function identified by `id_or_name`.
    pub async fn execute(&self, id_or_name: &str, request: ExecutionRequest) -> ExecutionResult {
        tracing::debug!(
            function = %id_or_name,
            args = request.args.len(),
            "execute: starting"
        );

        let mut audit = AuditEntryBuilder::new(id_or_name, &request.args);
        let result = self.run(id_or_name, request.args, &mut audit).await;
        let entry = audit.finish(&result);
        self.audit.log(&entry).await;

        match &result {
            Ok(_) => tracing::info!(
                execution_id = %entry.execution_id,
                function = %entry.function_name,
                duration_ms = entry.duration_ms,
                outcome = entry.outcome.label(),
                "execute: complete"
            ),
            Err(e) if e.kind == ErrorKind::HostFault => tracing::warn!(
                execution_id = %entry.execution_id,
                function = %entry.function_name,
                outcome = entry.outcome.label(),
                "execute: failed"
            ),
            Err(e) => tracing::info!(
                execution_id = %entry.execution_id,
                function = %entry.function_name,
                outcome = entry.outcome.label(),
                error = %e.message,
                "execute: failed"
            ),
        }

        ExecutionResult::from(result)
    }

    /// A structured error body for `error`, with a name suggestion for
    /// unknown functions.
    pub async fn structured_error(
        &self,
        id_or_name: &str,
        error: &ExecutionError,
    ) -> serde_json::Value {
        let names = self.registry.names().await;
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        error.to_structured_error(Some(id_or_name), Some(&names))
    }

    async fn run(
        &self,
        id_or_name: &str,
        args: Vec<DynamicValue>,
        audit: &mut AuditEntryBuilder,
    ) -> Result<DynamicValue, ExecutionError> {
        let definition = self.registry.get_definition(id_or_name).await.map_err(|e| {
            if e.kind() == ErrorKind::HostFault {
                tracing::error!(error = %e, "registry lookup failed");
            }
            ExecutionError::from(e)
        })?;
        audit.resolved(&definition.id, &definition.name, definition.code());

        if !definition.language.is_embedded() {
            return Err(ExecutionError::new(
                ErrorKind::UnsupportedLanguage,
                format!("Unsupported language: {}", definition.language),
            ));
        }

        let kv = self.kv.as_ref().map(|store| {
            Arc::new(store.scoped(definition.project_id.clone())) as Arc<dyn KvCapability>
        });
        let spec = InvocationSpec {
            function_name: definition.name.clone(),
            callable: definition.callable().to_string(),
            fallback_callable: definition
                .entry_point
                .is_some()
                .then(|| definition.name.clone()),
            source: definition.source,
            args,
            timeout_ms: definition.timeout,
            memory_limit_mb: definition.memory_limit,
            kv,
        };

        let outcome = self.executor.execute(spec).await;
        audit.record_release(outcome.report);
        outcome.result.map_err(|e| {
            if e.kind() == ErrorKind::HostFault {
                tracing::error!(error = %e, function = %definition.name, "host fault");
            }
            ExecutionError::from(e)
        })
    }
}
