//! Sandbox handle accounting.
//!
//! A [`SandboxHandle`] is a host-side reference to a value that lives inside
//! a V8 isolate. Handles are scoped to the V8 `HandleScope` they were created
//! in (the `'s` lifetime) and are counted by the owning context's
//! [`HandleLedger`]. Dropping a handle disposes it exactly once; there is no
//! other way to dispose one.
//!
//! The ledger exists so that teardown can prove every handle created during
//! an invocation was disposed before the isolate goes away. A non-zero live
//! count at release is a host fault, never a caller error.

use std::cell::Cell;
use std::rc::Rc;

use deno_core::v8;

#[derive(Debug, Default)]
struct LedgerCounts {
    created: Cell<usize>,
    disposed: Cell<usize>,
}

/// Per-context counter of created and disposed sandbox handles.
///
/// Cloning shares the same counters. The ledger is `!Send`, like the isolate
/// it describes.
#[derive(Debug, Clone, Default)]
pub struct HandleLedger(Rc<LedgerCounts>);

impl HandleLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a V8 local. The returned handle is disposed on drop.
    pub fn track<'s>(&self, local: v8::Local<'s, v8::Value>) -> SandboxHandle<'s> {
        self.0.created.set(self.0.created.get() + 1);
        SandboxHandle {
            local,
            ledger: self.clone(),
        }
    }

    /// Total handles created so far.
    pub fn created(&self) -> usize {
        self.0.created.get()
    }

    /// Total handles disposed so far.
    pub fn disposed(&self) -> usize {
        self.0.disposed.get()
    }

    /// Handles created but not yet disposed.
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.disposed())
    }

    fn record_dispose(&self) {
        self.0.disposed.set(self.0.disposed.get() + 1);
    }
}

/// A tracked reference to a sandbox-internal value.
///
/// Not `Clone`: each handle is disposed exactly once, when dropped. The
/// `'s` lifetime ties it to the V8 handle scope that owns the underlying
/// local, so it cannot outlive its context.
pub struct SandboxHandle<'s> {
    local: v8::Local<'s, v8::Value>,
    ledger: HandleLedger,
}

impl<'s> SandboxHandle<'s> {
    /// The underlying V8 value.
    pub fn local(&self) -> v8::Local<'s, v8::Value> {
        self.local
    }
}

impl std::fmt::Debug for SandboxHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle").finish_non_exhaustive()
    }
}

impl Drop for SandboxHandle<'_> {
    fn drop(&mut self) {
        self.ledger.record_dispose();
    }
}
