//! Sandbox lifecycle: one fresh, isolated V8 context per invocation.
//!
//! [`SandboxContext::acquire`] builds a new `JsRuntime` with its own isolate,
//! installs the heap-limit callback, arms the wall-clock watchdog and runs
//! the bootstrap script. [`SandboxContext::release`] consumes the context,
//! so releasing twice does not compile. A context that is dropped without
//! being released (early return, panic) is still torn down by `Drop`.
//!
//! V8 isolates are `!Send`; a context must be created, used and dropped on
//! one thread.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde::Serialize;

use crate::error::SandboxError;
use crate::handle::HandleLedger;
use crate::ops::{bootstrap_script, fnhost_ext, KvBinding};
use crate::KvCapability;

const MIB: usize = 1024 * 1024;

/// Smallest heap a context may be given. Below this the bootstrap itself
/// cannot complete.
pub const MIN_HEAP_SIZE: usize = 8 * MIB;

/// Resource bounds for a single context.
#[derive(Debug, Clone)]
pub struct ContextLimits {
    /// Wall-clock budget, measured from acquisition.
    pub timeout: Duration,
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
    /// Maximum kv operations allowed.
    pub max_kv_ops: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_heap_size: 64 * MIB,
            max_kv_ops: 100,
        }
    }
}

/// Counters reported when a context is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    /// Sandbox handles created over the context's lifetime.
    pub handles_created: usize,
    /// Sandbox handles disposed over the context's lifetime.
    pub handles_disposed: usize,
    /// Key/value operations performed.
    pub kv_ops: usize,
}

impl ReleaseReport {
    /// Handles created but never disposed.
    pub fn live(&self) -> usize {
        self.handles_created.saturating_sub(self.handles_disposed)
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the context's Box<HeapLimitState>. The
    // callback is removed from the isolate in `teardown` before the runtime
    // is dropped, and the box is only freed after that.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + MIB
}

/// Wall-clock watchdog thread. Terminates the isolate when the timeout
/// elapses before it is disarmed.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn arm(
        handle: v8::IsolateHandle,
        timeout: Duration,
        timed_out: Arc<AtomicBool>,
    ) -> Result<Self, SandboxError> {
        let (cancel, cancel_rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("fnhost-watchdog".into())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    timed_out.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;
        Ok(Self { cancel, thread })
    }

    /// Cancel the watchdog and wait for its thread to exit.
    fn disarm(self) {
        let _ = self.cancel.send(());
        if self.thread.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
    }
}

/// One isolated execution context.
pub struct SandboxContext {
    runtime: Option<JsRuntime>,
    ledger: HandleLedger,
    heap_state: Box<HeapLimitState>,
    timed_out: Arc<AtomicBool>,
    watchdog: Option<Watchdog>,
    kv_ops: Rc<Cell<usize>>,
    limits: ContextLimits,
}

impl SandboxContext {
    /// Allocate a fresh context.
    ///
    /// `kv` is the only state the context can share with other contexts.
    /// Without it the `kv` global is undefined.
    pub fn acquire(
        limits: &ContextLimits,
        kv: Option<Arc<dyn KvCapability>>,
    ) -> Result<Self, SandboxError> {
        let max_heap_size = limits.max_heap_size.max(MIN_HEAP_SIZE);
        let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![fnhost_ext::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let has_kv = kv.is_some();
        let kv_ops = Rc::new(Cell::new(0));
        if let Some(kv) = kv {
            runtime.op_state().borrow_mut().put(KvBinding {
                kv,
                max_ops: limits.max_kv_ops,
                ops_made: Rc::clone(&kv_ops),
            });
        }

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
        let mut ctx = Self {
            runtime: Some(runtime),
            ledger: HandleLedger::new(),
            heap_state,
            timed_out: Arc::new(AtomicBool::new(false)),
            watchdog: None,
            kv_ops,
            limits: ContextLimits {
                max_heap_size,
                ..limits.clone()
            },
        };

        ctx.watchdog = Some(Watchdog::arm(
            watchdog_handle,
            ctx.limits.timeout,
            Arc::clone(&ctx.timed_out),
        )?);

        let bootstrap = bootstrap_script(has_kv);
        let outcome = ctx
            .runtime()?
            .execute_script("[fnhost:bootstrap]", bootstrap);
        if let Err(e) = outcome {
            return Err(ctx.termination_cause().unwrap_or(SandboxError::Bootstrap {
                message: e.to_string(),
            }));
        }

        tracing::debug!(
            timeout_ms = ctx.limits.timeout.as_millis() as u64,
            max_heap_size = ctx.limits.max_heap_size,
            kv = has_kv,
            "sandbox context acquired"
        );
        Ok(ctx)
    }

    /// The effective limits of this context.
    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// The handle ledger for this context.
    pub fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }

    pub(crate) fn runtime(&mut self) -> Result<&mut JsRuntime, SandboxError> {
        self.runtime
            .as_mut()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("sandbox context torn down")))
    }

    /// Runtime and ledger borrowed together, for code that creates handles.
    pub(crate) fn parts(&mut self) -> Result<(&mut JsRuntime, &HandleLedger), SandboxError> {
        let runtime = self
            .runtime
            .as_mut()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("sandbox context torn down")))?;
        Ok((runtime, &self.ledger))
    }

    /// The resource limit that terminated execution, if any.
    ///
    /// Heap exhaustion takes precedence over the timeout.
    pub fn termination_cause(&self) -> Option<SandboxError> {
        if self.heap_state.triggered.load(Ordering::SeqCst) {
            return Some(SandboxError::HeapLimitExceeded {
                limit_mb: self.limits.max_heap_size / MIB,
            });
        }
        if self.timed_out.load(Ordering::SeqCst) {
            return Some(SandboxError::Timeout {
                timeout_ms: self.limits.timeout.as_millis() as u64,
            });
        }
        None
    }

    /// Current counters.
    pub fn report(&self) -> ReleaseReport {
        ReleaseReport {
            handles_created: self.ledger.created(),
            handles_disposed: self.ledger.disposed(),
            kv_ops: self.kv_ops.get(),
        }
    }

    /// Tear the context down and report its counters.
    ///
    /// Fails with [`SandboxError::HandleLeak`] if any handle created in this
    /// context is still live. The context is torn down either way.
    pub fn release(mut self) -> Result<ReleaseReport, SandboxError> {
        let report = self.report();
        self.teardown();

        tracing::debug!(
            handles_created = report.handles_created,
            handles_disposed = report.handles_disposed,
            kv_ops = report.kv_ops,
            "sandbox context released"
        );

        match report.live() {
            0 => Ok(report),
            live => Err(SandboxError::HandleLeak { live }),
        }
    }

    /// Idempotent teardown: watchdog first, then the heap callback, then
    /// the isolate.
    fn teardown(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.disarm();
        }
        if let Some(mut runtime) = self.runtime.take() {
            runtime
                .v8_isolate()
                .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
            drop(runtime);
        }
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
