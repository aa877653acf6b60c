//! The function invocation protocol.
//!
//! `Unevaluated → Evaluated → FunctionLocated → Invoked → {Success | Faulted}`
//!
//! Every handle created along the way is a [`SandboxHandle`] local to
//! [`run_protocol`], so all of them are disposed when it returns, on the
//! success path and on every error path alike. A returned promise is settled
//! with a single microtask checkpoint; there is no event loop.

use deno_core::v8;

use crate::context::SandboxContext;
use crate::error::SandboxError;
use crate::handle::{HandleLedger, SandboxHandle};
use crate::marshal::{from_sandbox, to_sandbox};
use crate::source::FunctionSource;
use crate::value::DynamicValue;

/// Protocol states, reported at `debug` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Nothing has run yet.
    Unevaluated,
    /// The source evaluated without error.
    Evaluated,
    /// The callable was found and is a function.
    FunctionLocated,
    /// The call returned (possibly a promise).
    Invoked,
    /// A host value was extracted.
    Success,
    /// Any failure.
    Faulted,
}

fn transition(state: InvocationState, callable: &str) {
    tracing::debug!(state = ?state, callable = %callable, "invocation state");
}

/// Evaluate `source`, call `callable` with `args` and return its result.
///
/// If `callable` is not a global function after evaluation, `fallback` is
/// looked up instead. A missing function is reported under `callable`.
///
/// When the watchdog or the heap callback terminated execution, the
/// resource error replaces whatever error the engine surfaced.
pub fn invoke(
    ctx: &mut SandboxContext,
    source: &FunctionSource,
    callable: &str,
    fallback: Option<&str>,
    args: &[DynamicValue],
) -> Result<DynamicValue, SandboxError> {
    let result = run_protocol(ctx, source, callable, fallback, args)
        .map_err(|err| ctx.termination_cause().unwrap_or(err));

    match &result {
        Ok(_) => transition(InvocationState::Success, callable),
        Err(err) => {
            transition(InvocationState::Faulted, callable);
            tracing::debug!(kind = %err.kind(), error = %err, "invocation faulted");
        }
    }
    result
}

fn run_protocol(
    ctx: &mut SandboxContext,
    source: &FunctionSource,
    callable: &str,
    fallback: Option<&str>,
    args: &[DynamicValue],
) -> Result<DynamicValue, SandboxError> {
    let (runtime, ledger) = ctx.parts()?;
    let code = source.render(callable);
    let scope = &mut runtime.handle_scope();
    let tc = &mut v8::TryCatch::new(scope);

    transition(InvocationState::Unevaluated, callable);
    let completion = evaluate(tc, ledger, &code)?;
    drop(completion);
    transition(InvocationState::Evaluated, callable);

    let located = match (locate(tc, ledger, callable), fallback) {
        (Err(SandboxError::FunctionNotFound { .. }), Some(name)) if name != callable => {
            locate(tc, ledger, name).map_err(|_| SandboxError::FunctionNotFound {
                name: callable.to_string(),
            })
        }
        (located, _) => located,
    };
    let (_function_handle, function) = located?;
    transition(InvocationState::FunctionLocated, callable);

    let mut arg_handles = Vec::with_capacity(args.len());
    for (index, arg) in args.iter().enumerate() {
        let handle = to_sandbox(tc, ledger, arg)
            .map_err(|source| SandboxError::ArgumentMarshal { index, source })?;
        arg_handles.push(handle);
    }
    let argv: Vec<v8::Local<v8::Value>> = arg_handles.iter().map(SandboxHandle::local).collect();

    let receiver = ledger.track(v8::undefined(tc).into());
    let returned = match function.call(tc, receiver.local(), &argv) {
        Some(value) => ledger.track(value),
        None => {
            return Err(SandboxError::JsError {
                message: describe_exception(tc, ledger),
            })
        }
    };
    transition(InvocationState::Invoked, callable);

    let settled = settle(tc, ledger, returned)?;
    from_sandbox(tc, ledger, &settled).map_err(SandboxError::ResultMarshal)
}

fn evaluate<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    ledger: &HandleLedger,
    code: &str,
) -> Result<SandboxHandle<'s>, SandboxError> {
    let source = v8::String::new(tc, code).ok_or_else(|| SandboxError::Compile {
        message: "function source cannot be represented in the sandbox".into(),
    })?;
    let _source_handle = ledger.track(source.into());

    let Some(script) = v8::Script::compile(tc, source, None) else {
        return Err(SandboxError::Compile {
            message: describe_compile_error(tc, ledger),
        });
    };
    match script.run(tc) {
        Some(completion) => Ok(ledger.track(completion)),
        None => Err(SandboxError::Compile {
            message: describe_compile_error(tc, ledger),
        }),
    }
}

fn locate<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    ledger: &HandleLedger,
    callable: &str,
) -> Result<(SandboxHandle<'s>, v8::Local<'s, v8::Function>), SandboxError> {
    let not_found = || SandboxError::FunctionNotFound {
        name: callable.to_string(),
    };

    let context = tc.get_current_context();
    let global = context.global(tc);
    let _global_handle = ledger.track(global.into());
    let key = v8::String::new(tc, callable).ok_or_else(not_found)?;
    let key_handle = ledger.track(key.into());

    let value = global.get(tc, key_handle.local()).ok_or_else(not_found)?;
    let handle = ledger.track(value);
    let function = v8::Local::<v8::Function>::try_from(handle.local()).map_err(|_| not_found())?;
    Ok((handle, function))
}

/// Resolve a returned promise with one microtask checkpoint. Non-promise
/// values pass through.
fn settle<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    ledger: &HandleLedger,
    returned: SandboxHandle<'s>,
) -> Result<SandboxHandle<'s>, SandboxError> {
    let Ok(promise) = v8::Local::<v8::Promise>::try_from(returned.local()) else {
        return Ok(returned);
    };

    tc.perform_microtask_checkpoint();
    if tc.has_terminated() {
        return Err(SandboxError::JsError {
            message: "execution terminated".into(),
        });
    }

    match promise.state() {
        v8::PromiseState::Fulfilled => Ok(ledger.track(promise.result(tc))),
        v8::PromiseState::Rejected => {
            let reason = ledger.track(promise.result(tc));
            Err(SandboxError::JsError {
                message: describe_value(tc, ledger, &reason),
            })
        }
        v8::PromiseState::Pending => Err(SandboxError::JsError {
            message: "function returned a promise that never settled".into(),
        }),
    }
}

fn describe_compile_error(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>,
    ledger: &HandleLedger,
) -> String {
    let description = describe_exception(tc, ledger);
    match tc.message().and_then(|m| m.get_line_number(tc)) {
        Some(line) => format!("{description} (line {line})"),
        None => description,
    }
}

/// Text for the exception caught by `tc`.
fn describe_exception(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>,
    ledger: &HandleLedger,
) -> String {
    if tc.has_terminated() {
        return "execution terminated".into();
    }
    match tc.exception() {
        Some(exception) => {
            let exception = ledger.track(exception);
            describe_value(tc, ledger, &exception)
        }
        None => "unknown exception".into(),
    }
}

/// Error objects render as `Name: message`; any other thrown value is
/// dumped and rendered as JSON (strings as themselves).
fn describe_value(
    scope: &mut v8::HandleScope,
    ledger: &HandleLedger,
    value: &SandboxHandle<'_>,
) -> String {
    let local = value.local();
    if local.is_native_error() {
        return local.to_rust_string_lossy(scope);
    }
    match from_sandbox(scope, ledger, value) {
        Ok(DynamicValue::String(s)) => s,
        Ok(other) => serde_json::Value::from(other).to_string(),
        Err(_) => local.to_rust_string_lossy(scope),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::ContextLimits;

    fn run(code: &str, callable: &str, args: &[serde_json::Value]) -> Result<DynamicValue, SandboxError> {
        run_with_fallback(code, callable, None, args)
    }

    fn run_with_fallback(
        code: &str,
        callable: &str,
        fallback: Option<&str>,
        args: &[serde_json::Value],
    ) -> Result<DynamicValue, SandboxError> {
        let mut ctx = SandboxContext::acquire(&ContextLimits::default(), None).unwrap();
        let args: Vec<DynamicValue> = args.iter().cloned().map(DynamicValue::from).collect();
        let result = invoke(&mut ctx, &FunctionSource::classify(code), callable, fallback, &args);
        let report = ctx.release().unwrap();
        assert_eq!(report.live(), 0, "handles leaked");
        result
    }

    #[test]
    fn calls_declared_function() {
        let v = run("function add(a, b) { return a + b; }", "add", &[json!(2), json!(3)]).unwrap();
        assert_eq!(v, DynamicValue::Number(5.0));
    }

    #[test]
    fn statement_body_sees_arguments() {
        let v = run("return arguments[0] * 2;", "double", &[json!(21)]).unwrap();
        assert_eq!(v, DynamicValue::Number(42.0));
    }

    #[test]
    fn syntax_error_is_compile_error() {
        let err = run("const x = ;", "f", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Compile { .. }), "{err:?}");
    }

    #[test]
    fn wrong_name_is_function_not_found() {
        let err = run("function other() { return 1; }", "f", &[]).unwrap_err();
        assert!(
            matches!(&err, SandboxError::FunctionNotFound { name } if name == "f"),
            "{err:?}"
        );
    }

    #[test]
    fn missing_entry_point_falls_back_to_name() {
        let code = "function add(a, b) { return a + b; }";
        let v = run_with_fallback(code, "main", Some("add"), &[json!(2), json!(3)]).unwrap();
        assert_eq!(v, DynamicValue::Number(5.0));

        let err = run_with_fallback(code, "main", Some("other"), &[]).unwrap_err();
        assert!(
            matches!(&err, SandboxError::FunctionNotFound { name } if name == "main"),
            "{err:?}"
        );
    }

    #[test]
    fn entry_point_wins_over_name() {
        let code = "function add() { return 'add'; } function main() { return 'main'; }";
        let v = run_with_fallback(code, "main", Some("add"), &[]).unwrap();
        assert_eq!(v, DynamicValue::String("main".into()));
    }

    #[test]
    fn thrown_error_is_runtime_error_with_message() {
        let err = run("function f() { throw new Error('boom'); }", "f", &[]).unwrap_err();
        match err {
            SandboxError::JsError { message } => assert_eq!(message, "Error: boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn thrown_object_is_dumped() {
        let err = run("function f() { throw { code: 7 }; }", "f", &[]).unwrap_err();
        match err {
            SandboxError::JsError { message } => assert_eq!(message, r#"{"code":7}"#),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolved_promise_is_success() {
        let v = run("async function f(x) { return x + 1; }", "f", &[json!(1)]).unwrap();
        assert_eq!(v, DynamicValue::Number(2.0));
    }

    #[test]
    fn rejected_promise_is_runtime_error() {
        let err = run("async function f() { throw new TypeError('bad'); }", "f", &[]).unwrap_err();
        assert!(
            matches!(&err, SandboxError::JsError { message } if message == "TypeError: bad"),
            "{err:?}"
        );
    }

    #[test]
    fn pending_promise_is_runtime_error() {
        let err = run("function f() { return new Promise(() => {}); }", "f", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::JsError { .. }), "{err:?}");
    }

    #[test]
    fn undefined_result_is_null() {
        let v = run("function f() {}", "f", &[]).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn cyclic_result_is_result_marshal_error() {
        let err = run("function f() { const a = {}; a.self = a; return a; }", "f", &[]).unwrap_err();
        assert!(
            matches!(err, SandboxError::ResultMarshal(crate::marshal::MarshalError::Circular)),
            "{err:?}"
        );
    }

    #[test]
    fn shared_subobjects_are_not_cycles() {
        let code = "function f() { const s = { x: 1 }; return { a: s, b: [s, s] }; }";
        let v = run(code, "f", &[]).unwrap();
        assert_eq!(
            serde_json::Value::from(v),
            json!({"a": {"x": 1}, "b": [{"x": 1}, {"x": 1}]})
        );
    }

    #[test]
    fn too_deep_argument_is_rejected_without_leaks() {
        let mut nested = json!(1);
        for _ in 0..70 {
            nested = json!([nested]);
        }
        let err = run("function f(x) { return x; }", "f", &[json!("ok"), nested]).unwrap_err();
        assert!(
            matches!(err, SandboxError::ArgumentMarshal { index: 1, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn infinite_loop_times_out() {
        let limits = ContextLimits {
            timeout: std::time::Duration::from_millis(100),
            ..Default::default()
        };
        let mut ctx = SandboxContext::acquire(&limits, None).unwrap();
        let source = FunctionSource::classify("while (true) {}");
        let err = invoke(&mut ctx, &source, "spin", None, &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }), "{err:?}");
        assert!(ctx.release().is_ok());
    }
}
