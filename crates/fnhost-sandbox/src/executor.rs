//! Sandbox executor: runs each invocation in a fresh context on its own
//! thread.
//!
//! V8 isolates are `!Send`, so every context is created, used and torn down
//! on a dedicated thread. The public API is async and `Send`-safe. A
//! semaphore caps the number of isolates alive at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::context::{ContextLimits, ReleaseReport, SandboxContext};
use crate::error::SandboxError;
use crate::invoke::invoke;
use crate::source::FunctionSource;
use crate::validator::{validate_callable, validate_code};
use crate::value::DynamicValue;
use crate::KvCapability;

#[cfg(feature = "metrics")]
use crate::metrics::FnhostMetrics;

const MIB: usize = 1024 * 1024;

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Default wall-clock budget per invocation.
    pub timeout: Duration,
    /// Ceiling for per-function timeouts.
    pub max_timeout: Duration,
    /// Default V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Ceiling for per-function memory limits, in bytes.
    pub max_heap_ceiling: usize,
    /// Maximum concurrent invocations.
    pub max_concurrent: usize,
    /// Maximum size of function source in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// Maximum kv operations per invocation.
    pub max_kv_ops: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            max_heap_size: 64 * MIB,
            max_heap_ceiling: 256 * MIB,
            max_concurrent: 8,
            max_code_size: 64 * 1024,
            max_output_size: MIB,
            max_kv_ops: 100,
        }
    }
}

impl SandboxConfig {
    /// The timeout for a function that requests `requested_ms`, clamped to
    /// [`SandboxConfig::max_timeout`]. Zero or absent selects the default.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_timeout),
            _ => self.timeout,
        }
    }

    /// The heap limit in bytes for a function that requests `requested_mb`
    /// MiB, clamped to [`SandboxConfig::max_heap_ceiling`].
    pub fn effective_heap_size(&self, requested_mb: Option<u64>) -> usize {
        match requested_mb {
            Some(mb) if mb > 0 => usize::try_from(mb)
                .ok()
                .and_then(|mb| mb.checked_mul(MIB))
                .unwrap_or(usize::MAX)
                .min(self.max_heap_ceiling),
            _ => self.max_heap_size,
        }
    }

    fn context_limits(&self, spec: &InvocationSpec) -> ContextLimits {
        ContextLimits {
            timeout: self.effective_timeout(spec.timeout_ms),
            max_heap_size: self.effective_heap_size(spec.memory_limit_mb),
            max_kv_ops: self.max_kv_ops,
        }
    }
}

/// Everything needed to run one invocation.
pub struct InvocationSpec {
    /// Name used in logs.
    pub function_name: String,
    /// Global binding to call after evaluation.
    pub callable: String,
    /// Binding tried when `callable` is not a global function.
    pub fallback_callable: Option<String>,
    /// The classified source.
    pub source: FunctionSource,
    /// Positional arguments.
    pub args: Vec<DynamicValue>,
    /// Requested timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Requested heap limit in MiB.
    pub memory_limit_mb: Option<u64>,
    /// Key/value capability to inject, if any.
    pub kv: Option<Arc<dyn KvCapability>>,
}

impl std::fmt::Debug for InvocationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationSpec")
            .field("function_name", &self.function_name)
            .field("callable", &self.callable)
            .field("fallback_callable", &self.fallback_callable)
            .field("args", &self.args.len())
            .field("timeout_ms", &self.timeout_ms)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("kv", &self.kv.is_some())
            .finish_non_exhaustive()
    }
}

/// The result of one invocation plus the released context's counters.
#[derive(Debug)]
pub struct InvocationOutcome {
    /// The function's result or the classified failure.
    pub result: Result<DynamicValue, SandboxError>,
    /// Counters from the released context. Zeroed if no context was created.
    pub report: ReleaseReport,
}

impl InvocationOutcome {
    fn failed(err: SandboxError) -> Self {
        Self {
            result: Err(err),
            report: ReleaseReport::default(),
        }
    }
}

/// The sandbox executor. Creates a fresh V8 isolate for each invocation.
///
/// This is `Send + Sync` safe; all V8 operations are dispatched to a
/// dedicated thread internally.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<FnhostMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record invocation metrics into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<FnhostMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The executor's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one invocation in a fresh context.
    ///
    /// Fails fast with [`SandboxError::ConcurrencyLimit`] when
    /// `max_concurrent` invocations are already running.
    pub async fn execute(&self, spec: InvocationSpec) -> InvocationOutcome {
        tracing::debug!(
            function = %spec.function_name,
            args = spec.args.len(),
            "sandbox: starting"
        );
        let start = Instant::now();

        let outcome = if let Err(e) = self.precheck(&spec) {
            InvocationOutcome::failed(e)
        } else {
            self.dispatch(spec).await
        };

        let elapsed = start.elapsed();
        match &outcome.result {
            Ok(_) => tracing::debug!(
                duration_ms = elapsed.as_millis() as u64,
                handles = outcome.report.handles_created,
                "sandbox: complete"
            ),
            Err(e) => tracing::debug!(kind = %e.kind(), error = %e, "sandbox: failed"),
        }

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            let kind = outcome.result.as_ref().err().map(|e| e.kind().as_str());
            m.record_execution(kind, elapsed.as_secs_f64());
        }

        outcome
    }

    /// Reject code the sandbox would never accept, before taking a permit.
    fn precheck(&self, spec: &InvocationSpec) -> Result<(), SandboxError> {
        validate_code(spec.source.code(), Some(self.config.max_code_size))?;
        validate_callable(&spec.callable)?;
        Ok(())
    }

    async fn dispatch(&self, spec: InvocationSpec) -> InvocationOutcome {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let limits = self.config.context_limits(&spec);
                let max_output_size = self.config.max_output_size;

                #[cfg(feature = "metrics")]
                if let Some(m) = &self.metrics {
                    m.contexts_alive.inc();
                }

                // V8 isolates are !Send; run everything on a dedicated thread
                let (tx, rx) = tokio::sync::oneshot::channel();
                let spawned = std::thread::Builder::new()
                    .name("fnhost-sandbox".into())
                    .spawn(move || {
                        // held until the context is torn down
                        let _permit = permit;
                        let rt = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(rt) => rt,
                            Err(e) => {
                                if tx
                                    .send(InvocationOutcome::failed(SandboxError::Execution(
                                        e.into(),
                                    )))
                                    .is_err()
                                {
                                    tracing::warn!("sandbox result receiver dropped");
                                }
                                return;
                            }
                        };
                        let _guard = rt.enter();
                        let outcome = run_invocation(&limits, max_output_size, spec);
                        if tx.send(outcome).is_err() {
                            tracing::warn!("sandbox result receiver dropped before result was sent");
                        }
                    });

                let outcome = match spawned {
                    Ok(_) => rx.await.unwrap_or_else(|_| {
                        InvocationOutcome::failed(SandboxError::Execution(anyhow::anyhow!(
                            "sandbox thread panicked"
                        )))
                    }),
                    Err(e) => InvocationOutcome::failed(SandboxError::Execution(e.into())),
                };

                #[cfg(feature = "metrics")]
                if let Some(m) = &self.metrics {
                    m.contexts_alive.dec();
                }

                outcome
            }
            Err(_) => InvocationOutcome::failed(SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }),
        }
    }
}

/// Run one invocation on the current thread: acquire, invoke, check the
/// output size, release.
///
/// Must be called from a thread that owns no other isolate in use.
pub fn run_invocation(
    limits: &ContextLimits,
    max_output_size: usize,
    spec: InvocationSpec,
) -> InvocationOutcome {
    let mut ctx = match SandboxContext::acquire(limits, spec.kv.clone()) {
        Ok(ctx) => ctx,
        Err(e) => return InvocationOutcome::failed(e),
    };

    let mut result = invoke(
        &mut ctx,
        &spec.source,
        &spec.callable,
        spec.fallback_callable.as_deref(),
        &spec.args,
    )
        .and_then(|value| check_output_size(&value, max_output_size).map(|()| value));

    let report = ctx.report();
    if let Err(leak) = ctx.release() {
        tracing::error!(error = %leak, function = %spec.function_name, "sandbox handle leak");
        result = Err(leak);
    }

    InvocationOutcome { result, report }
}

fn check_output_size(value: &DynamicValue, max: usize) -> Result<(), SandboxError> {
    let size = serde_json::to_vec(value)?.len();
    if size > max {
        return Err(SandboxError::OutputTooLarge { max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(code: &str, callable: &str, args: Vec<DynamicValue>) -> InvocationSpec {
        InvocationSpec {
            function_name: callable.to_string(),
            callable: callable.to_string(),
            fallback_callable: None,
            source: FunctionSource::classify(code),
            args,
            timeout_ms: None,
            memory_limit_mb: None,
            kv: None,
        }
    }

    #[test]
    fn timeout_is_clamped_to_ceiling() {
        let config = SandboxConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(5));
        assert_eq!(config.effective_timeout(Some(0)), Duration::from_secs(5));
        assert_eq!(config.effective_timeout(Some(250)), Duration::from_millis(250));
        assert_eq!(config.effective_timeout(Some(600_000)), Duration::from_secs(30));
    }

    #[test]
    fn heap_is_clamped_to_ceiling() {
        let config = SandboxConfig::default();
        assert_eq!(config.effective_heap_size(None), 64 * MIB);
        assert_eq!(config.effective_heap_size(Some(16)), 16 * MIB);
        assert_eq!(config.effective_heap_size(Some(4096)), 256 * MIB);
        assert_eq!(config.effective_heap_size(Some(u64::MAX)), 256 * MIB);
    }

    #[tokio::test]
    async fn executes_on_dedicated_thread() {
        let exec = SandboxExecutor::new(SandboxConfig::default());
        let outcome = exec
            .execute(spec(
                "function add(a, b) { return a + b; }",
                "add",
                vec![2.0.into(), 3.0.into()],
            ))
            .await;
        assert_eq!(outcome.result.unwrap(), DynamicValue::Number(5.0));
        assert_eq!(outcome.report.live(), 0);
        assert!(outcome.report.handles_created > 0);
    }

    #[tokio::test]
    async fn concurrency_limit_enforced() {
        // max_concurrent = 0 rejects deterministically
        let exec = SandboxExecutor::new(SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        });
        let outcome = exec.execute(spec("return 1;", "f", vec![])).await;
        assert!(
            matches!(outcome.result, Err(SandboxError::ConcurrencyLimit { max: 0 })),
            "{:?}",
            outcome.result
        );
    }

    #[tokio::test]
    async fn banned_code_never_reaches_v8() {
        let exec = SandboxExecutor::new(SandboxConfig::default());
        let outcome = exec
            .execute(spec("return Deno.env.get('HOME');", "leak", vec![]))
            .await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), fnhost_error::ErrorKind::CompileError);
        assert_eq!(outcome.report, ReleaseReport::default());
    }

    #[tokio::test]
    async fn large_output_is_rejected() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_output_size: 100,
            ..Default::default()
        });
        let outcome = exec
            .execute(spec("return 'x'.repeat(1000);", "big", vec![]))
            .await;
        assert!(
            matches!(outcome.result, Err(SandboxError::OutputTooLarge { max: 100 })),
            "{:?}",
            outcome.result
        );
        assert_eq!(outcome.report.live(), 0);
    }

    #[tokio::test]
    async fn per_function_timeout_applies() {
        let exec = SandboxExecutor::new(SandboxConfig::default());
        let mut spin = spec("while (true) {}", "spin", vec![]);
        spin.timeout_ms = Some(100);
        let start = Instant::now();
        let outcome = exec.execute(spin).await;
        assert!(
            matches!(outcome.result, Err(SandboxError::Timeout { timeout_ms: 100 })),
            "{:?}",
            outcome.result
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn heap_limit_prevents_oom() {
        let exec = SandboxExecutor::new(SandboxConfig {
            timeout: Duration::from_secs(30),
            ..Default::default()
        });
        let mut hog = spec(
            "const arr = []; while (true) { arr.push(new Array(100000).fill('x')); }",
            "hog",
            vec![],
        );
        hog.memory_limit_mb = Some(10);
        let outcome = exec.execute(hog).await;
        assert!(
            matches!(outcome.result, Err(SandboxError::HeapLimitExceeded { limit_mb: 10 })),
            "{:?}",
            outcome.result
        );
    }
}
