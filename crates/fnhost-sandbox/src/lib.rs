#![warn(missing_docs)]

//! # fnhost-sandbox
//!
//! V8 sandbox for the fnhost function execution engine.
//!
//! Runs tenant-supplied JavaScript in a deno_core isolate with no
//! filesystem, network or environment access. Values cross the boundary
//! only through the structural marshaller in [`marshal`]; the only shared
//! state is an optional [`KvCapability`].
//!
//! ## Security model
//!
//! - **Fresh isolate per invocation**: globals never leak between calls
//! - **No ambient capabilities**: `Deno`, `eval` and the function
//!   constructors are removed before user code runs
//! - **Pre-execution validation**: size and banned patterns are checked
//!   before source reaches V8
//! - **Resource limits**: wall-clock watchdog, heap ceiling, output size
//!   and a concurrency cap
//! - **Handle accounting**: every sandbox handle is counted, and a context
//!   released with live handles is reported as a leak

pub mod audit;
pub mod context;
pub mod error;
pub mod executor;
pub mod handle;
pub mod invoke;
pub mod kv;
pub mod marshal;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod source;
pub mod validator;
pub mod value;

use std::time::Duration;

pub use context::{ContextLimits, ReleaseReport, SandboxContext};
pub use error::SandboxError;
pub use executor::{InvocationOutcome, InvocationSpec, SandboxConfig, SandboxExecutor};
pub use handle::{HandleLedger, SandboxHandle};
pub use kv::{KvConfig, KvError, KvStore, NamespacedKv};
pub use source::{FunctionSource, SourceError};
pub use value::DynamicValue;

/// Key/value storage exposed to sandboxed code as the `kv` global.
///
/// Implementations are already scoped to one tenant; sandbox code cannot
/// name a namespace. Calls are synchronous because they run on the
/// sandbox thread in the middle of JavaScript execution.
pub trait KvCapability: Send + Sync {
    /// Read a value. `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError>;

    /// Write a value with an optional TTL. `None` selects the store default.
    fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// All live keys, sorted.
    fn keys(&self) -> Result<Vec<String>, KvError>;
}
