//! End-to-end tests through the public executor API.
//!
//! Each test spins up real V8 isolates on dedicated threads.

use std::sync::Arc;
use std::time::Duration;

use fnhost_error::ErrorKind;
use fnhost_sandbox::{
    DynamicValue, FunctionSource, InvocationSpec, KvCapability, KvConfig, KvStore, SandboxConfig,
    SandboxError, SandboxExecutor,
};
use serde_json::json;

fn executor() -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig::default())
}

fn spec(code: &str, callable: &str, args: Vec<serde_json::Value>) -> InvocationSpec {
    InvocationSpec {
        function_name: callable.to_string(),
        callable: callable.to_string(),
        fallback_callable: None,
        source: FunctionSource::resolve(code, callable, None).unwrap(),
        args: args.into_iter().map(DynamicValue::from).collect(),
        timeout_ms: None,
        memory_limit_mb: None,
        kv: None,
    }
}

fn with_kv(mut spec: InvocationSpec, kv: Arc<dyn KvCapability>) -> InvocationSpec {
    spec.kv = Some(kv);
    spec
}

async fn run(exec: &SandboxExecutor, spec: InvocationSpec) -> Result<serde_json::Value, SandboxError> {
    let outcome = exec.execute(spec).await;
    assert_eq!(outcome.report.live(), 0, "handles leaked: {:?}", outcome.report);
    outcome.result.map(serde_json::Value::from)
}

// --- protocol scenarios ---

/// SB-I01: a declared function is called with its arguments.
#[tokio::test]
async fn sb_i01_add() {
    let v = run(&executor(), spec("function add(a,b){return a+b}", "add", vec![json!(2), json!(3)]))
        .await
        .unwrap();
    assert_eq!(v, json!(5));
}

/// SB-I02: a syntax error is a compile error.
#[tokio::test]
async fn sb_i02_syntax_error() {
    let err = run(&executor(), spec("const x = ;", "broken", vec![])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompileError, "{err}");
}

/// SB-I03: a thrown error is a runtime error carrying the message.
#[tokio::test]
async fn sb_i03_throw() {
    let err = run(
        &executor(),
        spec(r#"function f(){ throw new Error("boom") }"#, "f", vec![]),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("boom"), "{err}");
}

/// SB-I04: a nested argument comes back unchanged.
#[tokio::test]
async fn sb_i04_nested_identity() {
    let input = json!({"a": [1, {"b": "x"}], "c": null});
    let v = run(&executor(), spec("function id(v){ return v; }", "id", vec![input.clone()]))
        .await
        .unwrap();
    assert_eq!(v, input);
}

/// SB-I05: a declaration under a different name is not found.
#[tokio::test]
async fn sb_i05_function_not_found() {
    let mut s = spec("function other(){ return 1; }", "other", vec![]);
    s.callable = "missing".into();
    let err = run(&executor(), s).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FunctionNotFound);
}

/// SB-I06: statement bodies get their arguments through `arguments`.
#[tokio::test]
async fn sb_i06_statement_body() {
    let v = run(
        &executor(),
        spec(
            "const [xs] = arguments; return xs.map((n) => n * n);",
            "squares",
            vec![json!([1, 2, 3])],
        ),
    )
    .await
    .unwrap();
    assert_eq!(v, json!([1, 4, 9]));
}

// --- no-leak and isolation ---

/// SB-I07: counters return to zero across a mix of outcomes.
#[tokio::test]
async fn sb_i07_no_leak_over_many_invocations() {
    let exec = executor();
    let cases = [
        ("function ok(a){ return {a, list: [a, a]}; }", "ok", true),
        ("function bad(){ throw new Error('x'); }", "bad", false),
        ("return [1, [2, [3, [4]]]];", "body", true),
        ("async function later(a){ return a; }", "later", true),
    ];
    for round in 0..5 {
        for (code, callable, should_succeed) in cases {
            let outcome = exec
                .execute(spec(code, callable, vec![json!({"round": round})]))
                .await;
            assert_eq!(outcome.result.is_ok(), should_succeed, "{callable}: {:?}", outcome.result);
            assert!(outcome.report.handles_created > 0);
            assert_eq!(outcome.report.handles_created, outcome.report.handles_disposed);
        }
    }
}

/// SB-I08: concurrent invocations defining the same global do not see
/// each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sb_i08_isolation_under_concurrency() {
    let exec = Arc::new(executor());
    let mut tasks = Vec::new();
    for i in 0..6 {
        let exec = Arc::clone(&exec);
        tasks.push(tokio::spawn(async move {
            let code = r#"
                function claim(tag) {
                    const before = typeof globalThis.shared === 'undefined' ? null : globalThis.shared;
                    globalThis.shared = tag;
                    return { before, after: globalThis.shared };
                }
            "#;
            let outcome = exec.execute(spec(code, "claim", vec![json!(i)])).await;
            (i, outcome)
        }));
    }
    let mut completed = 0;
    for task in tasks {
        let (i, outcome) = task.await.unwrap();
        match outcome.result {
            Ok(v) => {
                assert_eq!(serde_json::Value::from(v), json!({"before": null, "after": i}));
                completed += 1;
            }
            // more tasks than permits may be rejected; never cross-talk
            Err(SandboxError::ConcurrencyLimit { .. }) => {}
            Err(other) => panic!("unexpected failure: {other}"),
        }
    }
    assert!(completed > 0);
}

/// SB-I09: a global set by one invocation is gone in the next.
#[tokio::test]
async fn sb_i09_globals_do_not_persist() {
    let exec = executor();
    run(&exec, spec("globalThis.leaked = 42; return 1;", "set", vec![]))
        .await
        .unwrap();
    let v = run(&exec, spec("return typeof globalThis.leaked;", "get", vec![]))
        .await
        .unwrap();
    assert_eq!(v, json!("undefined"));
}

// --- resource bounds ---

/// SB-I10: an infinite loop is stopped by the watchdog.
#[tokio::test]
async fn sb_i10_timeout() {
    let exec = SandboxExecutor::new(SandboxConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let err = run(&exec, spec("while (true) {}", "spin", vec![])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
    assert!(matches!(err, SandboxError::Timeout { timeout_ms: 200 }), "{err:?}");
}

/// SB-I11: unbounded allocation hits the heap ceiling, not the host.
#[tokio::test]
async fn sb_i11_heap_limit() {
    let exec = SandboxExecutor::new(SandboxConfig {
        timeout: Duration::from_secs(30),
        max_heap_size: 16 * 1024 * 1024,
        ..Default::default()
    });
    let err = run(
        &exec,
        spec(
            "const chunks = []; while (true) { chunks.push(new Array(50000).fill('data')); }",
            "hog",
            vec![],
        ),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExceeded, "{err}");
}

/// SB-I12: the executor keeps working after a resource fault.
#[tokio::test]
async fn sb_i12_recovers_after_fault() {
    let exec = SandboxExecutor::new(SandboxConfig {
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    assert!(run(&exec, spec("for (;;) {}", "spin", vec![])).await.is_err());
    let v = run(&exec, spec("return 'alive';", "ping", vec![])).await.unwrap();
    assert_eq!(v, json!("alive"));
}

// --- hardening ---

/// SB-I13: Deno, eval and the function constructors are unavailable.
#[tokio::test]
async fn sb_i13_hardened_globals() {
    let v = run(
        &executor(),
        spec(
            r#"
            return {
                deno: typeof globalThis.Deno,
                evalType: typeof globalThis.eval,
                ctor: typeof (function () {}).constructor,
                asyncCtor: typeof (async function () {}).constructor,
            };
            "#,
            "inspect",
            vec![],
        ),
    )
    .await
    .unwrap();
    assert_eq!(
        v,
        json!({"deno": "undefined", "evalType": "undefined", "ctor": "undefined", "asyncCtor": "undefined"})
    );
}

/// SB-I14: console is callable and cannot be replaced.
#[tokio::test]
async fn sb_i14_console_is_frozen() {
    let v = run(
        &executor(),
        spec(
            r#"
            console.log('hello', { n: 1 });
            console.warn('careful');
            try { console.log = null; } catch (_) {}
            return typeof console.log;
            "#,
            "talk",
            vec![],
        ),
    )
    .await
    .unwrap();
    assert_eq!(v, json!("function"));
}

// --- kv capability ---

/// SB-I15: kv state persists across invocations in one namespace.
#[tokio::test]
async fn sb_i15_kv_persists_across_invocations() {
    let exec = executor();
    let store = Arc::new(KvStore::new(KvConfig::default()));
    let kv: Arc<dyn KvCapability> = Arc::new(store.scoped("project-a"));

    let counter = r#"
        const n = (kv.get('count') || 0) + 1;
        kv.put('count', n);
        return n;
    "#;
    for expected in 1..=3 {
        let v = run(&exec, with_kv(spec(counter, "bump", vec![]), Arc::clone(&kv)))
            .await
            .unwrap();
        assert_eq!(v, json!(expected));
    }
    assert_eq!(store.get("project-a", "count").unwrap(), Some(json!(3)));
}

/// SB-I16: namespaces never see each other's keys.
#[tokio::test]
async fn sb_i16_kv_namespace_isolation() {
    let exec = executor();
    let store = Arc::new(KvStore::new(KvConfig::default()));
    let a: Arc<dyn KvCapability> = Arc::new(store.scoped("a"));
    let b: Arc<dyn KvCapability> = Arc::new(store.scoped("b"));

    run(&exec, with_kv(spec("kv.put('secret', 'a-only'); return null;", "w", vec![]), a))
        .await
        .unwrap();
    let v = run(
        &exec,
        with_kv(spec("return { value: kv.get('secret'), keys: kv.keys() };", "r", vec![]), b),
    )
    .await
    .unwrap();
    assert_eq!(v, json!({"value": null, "keys": []}));
}

/// SB-I17: the per-invocation kv operation limit surfaces as a JS error.
#[tokio::test]
async fn sb_i17_kv_op_limit() {
    let exec = SandboxExecutor::new(SandboxConfig {
        max_kv_ops: 5,
        ..Default::default()
    });
    let store = Arc::new(KvStore::new(KvConfig::default()));
    let kv: Arc<dyn KvCapability> = Arc::new(store.scoped("ops"));

    let outcome = exec
        .execute(with_kv(
            spec("for (let i = 0; i < 10; i++) { kv.put('k' + i, i); } return 1;", "flood", vec![]),
            kv,
        ))
        .await;
    let err = outcome.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("kv operation limit"), "{err}");
    assert_eq!(outcome.report.kv_ops, 5);
    assert_eq!(store.keys("ops").len(), 5);
}

/// SB-I18: without an injected capability there is no kv global.
#[tokio::test]
async fn sb_i18_no_kv_without_capability() {
    let v = run(&executor(), spec("return typeof kv;", "inspect", vec![]))
        .await
        .unwrap();
    assert_eq!(v, json!("undefined"));
}
