//! Audit logging for function executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - The function id and name
//! - SHA-256 hashes of the source and of the arguments (never raw values)
//! - Handle and kv counters from the sandbox context
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::time::Instant;

use chrono::{DateTime, Utc};
use fnhost_error::{ErrorKind, ExecutionError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::ReleaseReport;
use crate::value::DynamicValue;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// Id of the resolved definition, if resolution succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// The id or name as requested, or the resolved definition name.
    pub function_name: String,
    /// SHA-256 hash of the function source. Empty if never resolved.
    pub code_hash: String,
    /// SHA-256 hash of the JSON-serialized argument list.
    pub args_hash: String,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized result in bytes.
    pub result_size_bytes: usize,
    /// Sandbox handles created during the invocation.
    pub handles_created: usize,
    /// Sandbox handles disposed during the invocation.
    pub handles_disposed: usize,
    /// Key/value operations made during the invocation.
    pub kv_ops: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of an execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Execution completed successfully.
    Success,
    /// Execution failed.
    Error {
        /// The error kind.
        kind: ErrorKind,
        /// The caller-visible error message.
        message: String,
    },
}

impl AuditOutcome {
    /// Short label for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error { kind, .. } => kind.as_str(),
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the underlying sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "failed to flush audit log");
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` level with `audit = true` for easy filtering.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            function_id = entry.function_id.as_deref().unwrap_or(""),
            function_name = %entry.function_name,
            code_hash = %entry.code_hash,
            args_hash = %entry.args_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            handles_created = entry.handles_created,
            handles_disposed = entry.handles_disposed,
            kv_ops = entry.kv_ops,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    function_id: Option<String>,
    function_name: String,
    code_hash: String,
    args_hash: String,
    report: ReleaseReport,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a request.
    pub fn new(function_name: &str, args: &[DynamicValue]) -> Self {
        let args_json = serde_json::to_string(args).unwrap_or_default();
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            function_id: None,
            function_name: function_name.to_string(),
            code_hash: String::new(),
            args_hash: sha256_hex(&args_json),
            report: ReleaseReport::default(),
            start: Instant::now(),
        }
    }

    /// The generated execution id.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record the resolved definition.
    pub fn resolved(&mut self, id: &str, name: &str, code: &str) {
        self.function_id = Some(id.to_string());
        self.function_name = name.to_string();
        self.code_hash = sha256_hex(code);
    }

    /// Record sandbox counters from the released context.
    pub fn record_release(&mut self, report: ReleaseReport) {
        self.report = report;
    }

    /// Finalize the audit entry with the execution result.
    pub fn finish(self, result: &Result<DynamicValue, ExecutionError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(value) => {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(e) => (
                0,
                AuditOutcome::Error {
                    kind: e.kind,
                    message: e.message.clone(),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            function_id: self.function_id,
            function_name: self.function_name,
            code_hash: self.code_hash,
            args_hash: self.args_hash,
            duration_ms,
            result_size_bytes,
            handles_created: self.report.handles_created,
            handles_disposed: self.report.handles_disposed,
            kv_ops: self.report.kv_ops,
            outcome,
        }
    }
}
