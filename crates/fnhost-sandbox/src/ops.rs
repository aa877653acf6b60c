//! deno_core op definitions for the fnhost sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::KvCapability;

/// Key/value binding for one invocation, stored in OpState.
///
/// Only present when a capability was injected at context creation.
pub struct KvBinding {
    /// The injected capability.
    pub kv: Arc<dyn KvCapability>,
    /// Maximum kv operations allowed in this invocation.
    pub max_ops: usize,
    /// Number of kv operations made so far, shared with the owning context.
    pub ops_made: Rc<Cell<usize>>,
}

/// Count one kv operation against the per-invocation budget and return the
/// capability.
fn charge(state: &mut OpState) -> Result<Arc<dyn KvCapability>, JsErrorBox> {
    let binding = state
        .try_borrow::<KvBinding>()
        .ok_or_else(|| JsErrorBox::generic("kv is not available in this context"))?;
    if binding.ops_made.get() >= binding.max_ops {
        return Err(JsErrorBox::generic(format!(
            "kv operation limit exceeded (max {} per invocation)",
            binding.max_ops
        )));
    }
    binding.ops_made.set(binding.ops_made.get() + 1);
    Ok(Arc::clone(&binding.kv))
}

/// Forward a `console.*` call from sandbox code to tracing.
#[op2(fast)]
pub fn op_fnhost_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "fnhost::sandbox::js", "{}", msg),
        "warn" => tracing::warn!(target: "fnhost::sandbox::js", "{}", msg),
        "debug" => tracing::debug!(target: "fnhost::sandbox::js", "{}", msg),
        _ => tracing::info!(target: "fnhost::sandbox::js", "{}", msg),
    }
}

/// Read a key. Returns the JSON text of the value, or `null`.
#[op2]
#[string]
pub fn op_fnhost_kv_get(state: &mut OpState, #[string] key: &str) -> Result<String, JsErrorBox> {
    let kv = charge(state)?;
    tracing::debug!(key = %key, "kv get");
    let value = kv
        .get(key)
        .map_err(|e| JsErrorBox::generic(e.to_string()))?;
    serde_json::to_string(&value.unwrap_or(serde_json::Value::Null))
        .map_err(|e| JsErrorBox::generic(format!("kv value serialization failed: {e}")))
}

/// Store a key. `ttl_secs` of zero (or less) selects the store's default TTL.
#[op2(fast)]
pub fn op_fnhost_kv_put(
    state: &mut OpState,
    #[string] key: &str,
    #[string] value_json: &str,
    ttl_secs: f64,
) -> Result<(), JsErrorBox> {
    let kv = charge(state)?;
    tracing::debug!(key = %key, value_len = value_json.len(), "kv put");
    let value: serde_json::Value = serde_json::from_str(value_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid kv value: {e}")))?;
    let ttl = if ttl_secs.is_finite() && ttl_secs > 0.0 {
        Some(Duration::from_secs_f64(ttl_secs))
    } else {
        None
    };
    kv.put(key, value, ttl)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Delete a key. Returns whether a live entry was removed.
#[op2(fast)]
pub fn op_fnhost_kv_delete(state: &mut OpState, #[string] key: &str) -> Result<bool, JsErrorBox> {
    let kv = charge(state)?;
    tracing::debug!(key = %key, "kv delete");
    kv.delete(key).map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// List live keys as a JSON array.
#[op2]
#[string]
pub fn op_fnhost_kv_keys(state: &mut OpState) -> Result<String, JsErrorBox> {
    let kv = charge(state)?;
    let keys = kv.keys().map_err(|e| JsErrorBox::generic(e.to_string()))?;
    serde_json::to_string(&keys)
        .map_err(|e| JsErrorBox::generic(format!("kv keys serialization failed: {e}")))
}

deno_core::extension!(
    fnhost_ext,
    ops = [
        op_fnhost_log,
        op_fnhost_kv_get,
        op_fnhost_kv_put,
        op_fnhost_kv_delete,
        op_fnhost_kv_keys,
    ],
);

/// Build the bootstrap script run in every fresh context before user code.
///
/// Installs a frozen `console`, an optional frozen `kv` object, removes the
/// `Deno` namespace and `eval`, and strips the function constructors from
/// their prototypes.
pub(crate) fn bootstrap_script(has_kv: bool) -> String {
    let mut parts = vec![
        r#"((ops) => {
                    const log = ops.op_fnhost_log;
                    const format = (args) => args.map((a) => {
                        if (typeof a === 'string') return a;
                        try { return JSON.stringify(a); } catch (_) { return String(a); }
                    }).join(' ');
                    const console = Object.freeze({
                        log: (...args) => log('info', format(args)),
                        info: (...args) => log('info', format(args)),
                        warn: (...args) => log('warn', format(args)),
                        error: (...args) => log('error', format(args)),
                        debug: (...args) => log('debug', format(args)),
                    });
                    Object.defineProperty(globalThis, 'console', {
                        value: console, configurable: false, writable: false
                    });"#
            .to_string(),
    ];

    if has_kv {
        parts.push(
            r#"
                    const kvGet = ops.op_fnhost_kv_get;
                    const kvPut = ops.op_fnhost_kv_put;
                    const kvDelete = ops.op_fnhost_kv_delete;
                    const kvKeys = ops.op_fnhost_kv_keys;
                    const kv = Object.freeze({
                        get: (key) => JSON.parse(kvGet(String(key))),
                        put: (key, value, options) => {
                            const json = JSON.stringify(value === undefined ? null : value);
                            kvPut(String(key), json, Number((options && options.ttl) || 0));
                        },
                        delete: (key) => kvDelete(String(key)),
                        keys: () => JSON.parse(kvKeys()),
                    });
                    Object.defineProperty(globalThis, 'kv', {
                        value: kv, configurable: false, writable: false
                    });"#
                .to_string(),
        );
    }

    parts.push(
        r#"
                    delete globalThis.Deno;
                    delete globalThis.eval;
                    const AsyncFunction = (async function(){}).constructor;
                    const GeneratorFunction = (function*(){}).constructor;
                    Object.defineProperty(Function.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                })(Deno.core.ops);"#
            .to_string(),
    );

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_without_kv_has_no_kv_global() {
        let script = bootstrap_script(false);
        assert!(!script.contains("globalThis, 'kv'"));
        assert!(script.contains("delete globalThis.Deno"));
        assert!(script.contains("delete globalThis.eval"));
    }

    #[test]
    fn bootstrap_with_kv_binds_all_ops() {
        let script = bootstrap_script(true);
        for op in [
            "op_fnhost_kv_get",
            "op_fnhost_kv_put",
            "op_fnhost_kv_delete",
            "op_fnhost_kv_keys",
        ] {
            assert!(script.contains(op), "missing {op}");
        }
    }
}
