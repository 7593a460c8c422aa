//! Integration tests for the policy evaluator against a mock guest module.
//!
//! The guest (`testdata/mock_policy.wat`) implements the ABI surface over
//! real linear memory — bump allocator, heap pointer global, identity JSON
//! codec — so heap checkpointing, the memory bridge, and builtin dispatch
//! are exercised through actual sandboxed execution.

use std::sync::Arc;

use opa_sandbox::{
    Builtin, BuiltinRegistry, OpaConfig, OpaError, OpaPolicy, OpaSandbox, ParamType,
};
use serde_json::{json, Value};

const MOCK_WAT: &str = include_str!("testdata/mock_policy.wat");

const ABI_MAJOR_LINE: &str = r#"(global (export "opa_wasm_abi_version") i32 (i32.const 1))"#;
const ABI_MINOR_LINE: &str = r#"(global (export "opa_wasm_abi_minor_version") i32 (i32.const 2))"#;

fn sandbox() -> OpaSandbox {
    OpaSandbox::new(OpaConfig::default()).expect("failed to create sandbox")
}

fn mock_policy(sandbox: &OpaSandbox) -> OpaPolicy {
    OpaPolicy::from_bytes(sandbox, "mock_policy", MOCK_WAT).expect("failed to build policy")
}

fn echo_registry() -> Arc<BuiltinRegistry> {
    fn echo(args: &[Value]) -> Result<Value, String> {
        Ok(args[0].clone())
    }
    let mut registry = BuiltinRegistry::with_defaults();
    registry.register(Builtin::new(
        "test.echo",
        vec![ParamType::Any],
        ParamType::Any,
        echo,
    ));
    Arc::new(registry)
}

fn mock_policy_with_echo(sandbox: &OpaSandbox) -> OpaPolicy {
    let module = sandbox
        .load_module_bytes("mock_policy", MOCK_WAT)
        .expect("failed to load module");
    OpaPolicy::with_registry(sandbox, &module, echo_registry()).expect("failed to build policy")
}

#[test]
fn test_construction_reads_metadata() {
    let sandbox = sandbox();
    let policy = mock_policy(&sandbox);

    assert_eq!(policy.entrypoints().len(), 6);
    assert_eq!(policy.entrypoints()["example"], 0);
    assert_eq!(policy.entrypoints()["example/builtin"], 2);

    assert_eq!(policy.builtins()[&0], "test.echo");
    assert_eq!(policy.builtins()[&1], "test.fail");

    let version = policy.abi_version().expect("version globals exported");
    assert_eq!(version.major, 1);
    assert_eq!(version.minor, Some(2));
}

#[test]
fn test_json_round_trip() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);

    let documents = [
        r#"42"#,
        r#"true"#,
        r#""unicode: éø 日本語""#,
        r#"[1,2,[3,{"a":null}]]"#,
        r#"{"nested":{"array":[1.5,"two"],"flag":false}}"#,
    ];
    for doc in documents {
        let out = policy.evaluate(doc).expect("evaluate failed");
        let expected: Value = serde_json::from_str(doc).unwrap();
        let actual: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(actual, expected, "round trip mismatch for {}", doc);
    }
}

#[test]
fn test_set_data_is_idempotent() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);

    policy.set_data(r#"{"world":"world"}"#).unwrap();
    let first = (policy.data_address(), policy.heap_watermarks());

    policy.set_data(r#"{"world":"world"}"#).unwrap();
    let second = (policy.data_address(), policy.heap_watermarks());

    assert_eq!(first, second);
}

#[test]
fn test_evaluation_scratch_does_not_accumulate() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);
    policy.set_data(r#"{"k":"v"}"#).unwrap();

    // same-length inputs: identical post-call watermarks prove the heap is
    // rewound between calls
    policy.evaluate(r#"{"n":1}"#).unwrap();
    let after_first = policy.current_heap_ptr().unwrap();

    policy.evaluate(r#"{"n":2}"#).unwrap();
    let after_second = policy.current_heap_ptr().unwrap();

    assert_eq!(after_first, after_second);

    for _ in 0..10 {
        policy.evaluate(r#"{"n":3}"#).unwrap();
    }
    assert_eq!(policy.current_heap_ptr().unwrap(), after_first);
}

#[test]
fn test_data_document_visible_to_evaluation() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);
    policy.set_data(r#"{"world":"world"}"#).unwrap();

    // entrypoint 1 echoes the data document
    let out = policy.evaluate_at("example/data", "null").unwrap();
    let actual: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(actual, json!({"world": "world"}));
}

#[test]
fn test_entrypoint_by_name_and_id_are_equivalent() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);
    policy.set_data(r#"{"a":1}"#).unwrap();

    let id = policy.entrypoints()["example/data"];
    let by_name = policy.evaluate_at("example/data", "null").unwrap();
    let by_id = policy.evaluate_at(id, "null").unwrap();

    assert_eq!(by_name, by_id);
}

#[test]
fn test_unknown_entrypoint() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);

    match policy.evaluate_at("no/such/rule", "null") {
        Err(OpaError::UnknownEntrypoint(name)) => assert_eq!(name, "no/such/rule"),
        other => panic!("expected UnknownEntrypoint, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        policy.evaluate_at(42, "null"),
        Err(OpaError::UnknownEntrypoint(_))
    ));

    // the evaluator stays usable after a failed resolution
    assert!(policy.evaluate("1").is_ok());
}

#[test]
fn test_builtin_dispatch_echo() {
    let sandbox = sandbox();
    let mut policy = mock_policy_with_echo(&sandbox);

    // entrypoint 2 routes the input document through builtin id 0
    let out = policy.evaluate_at("example/builtin", "42").unwrap();
    let actual: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(actual, json!(42));

    let out = policy
        .evaluate_at("example/builtin", r#"{"deep":["echo"]}"#)
        .unwrap();
    let actual: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(actual, json!({"deep": ["echo"]}));
}

#[test]
fn test_builtin_arity_mismatch() {
    let sandbox = sandbox();
    let mut policy = mock_policy_with_echo(&sandbox);

    // entrypoint 3 invokes the 1-ary builtin through the 0-ary stub
    match policy.evaluate_at("example/arity", "null") {
        Err(OpaError::BuiltinArityMismatch {
            name,
            expected,
            given,
        }) => {
            assert_eq!(name, "test.echo");
            assert_eq!(expected, 1);
            assert_eq!(given, 0);
        }
        other => panic!("expected BuiltinArityMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_builtin_argument_decode_failure() {
    fn double(args: &[Value]) -> Result<Value, String> {
        Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
    }
    let sandbox = sandbox();
    let module = sandbox
        .load_module_bytes("mock_policy", MOCK_WAT)
        .expect("failed to load module");

    // declare builtin id 0 as integer-only, then feed it a string
    let mut registry = BuiltinRegistry::new();
    registry.register(Builtin::new(
        "test.echo",
        vec![ParamType::Integer],
        ParamType::Integer,
        double,
    ));
    let mut policy =
        OpaPolicy::with_registry(&sandbox, &module, Arc::new(registry)).expect("policy");

    let out = policy.evaluate_at("example/builtin", "21").unwrap();
    assert_eq!(serde_json::from_str::<Value>(&out).unwrap(), json!(42));

    match policy.evaluate_at("example/builtin", r#""not a number""#) {
        Err(OpaError::BuiltinArgumentDecode { name, index, .. }) => {
            assert_eq!(name, "test.echo");
            assert_eq!(index, 0);
        }
        other => panic!(
            "expected BuiltinArgumentDecode, got {:?}",
            other.map(|_| ())
        ),
    }
}

#[test]
fn test_builtin_handler_failure_traps_evaluation() {
    fn always_fails(_: &[Value]) -> Result<Value, String> {
        Err("synthetic failure".to_string())
    }
    let sandbox = sandbox();
    let module = sandbox
        .load_module_bytes("mock_policy", MOCK_WAT)
        .expect("failed to load module");

    let mut registry = BuiltinRegistry::new();
    registry.register(Builtin::new(
        "test.echo",
        vec![ParamType::Any],
        ParamType::Any,
        always_fails,
    ));
    let mut policy =
        OpaPolicy::with_registry(&sandbox, &module, Arc::new(registry)).expect("policy");

    match policy.evaluate_at("example/builtin", "1") {
        Err(OpaError::BuiltinExecution { name, reason }) => {
            assert_eq!(name, "test.echo");
            assert_eq!(reason, "synthetic failure");
        }
        other => panic!("expected BuiltinExecution, got {:?}", other.map(|_| ())),
    }

    // the evaluator survives the trapped evaluation
    assert!(policy.evaluate("1").is_ok());
}

#[test]
fn test_unknown_builtin_id() {
    let sandbox = sandbox();
    let mut policy = mock_policy_with_echo(&sandbox);

    match policy.evaluate_at("example/unknown", "null") {
        Err(OpaError::UnknownBuiltinId(id)) => assert_eq!(id, 99),
        other => panic!("expected UnknownBuiltinId, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_unsupported_builtin() {
    let sandbox = sandbox();
    // default registry has no `test.echo`
    let mut policy = mock_policy(&sandbox);

    match policy.evaluate_at("example/builtin", "42") {
        Err(OpaError::UnsupportedBuiltin(name)) => assert_eq!(name, "test.echo"),
        other => panic!("expected UnsupportedBuiltin, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_abort_surfaces_as_trap_and_evaluator_recovers() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);

    match policy.evaluate_at("example/abort", "null") {
        Err(OpaError::SandboxTrap(message)) => assert_eq!(message, "mock abort"),
        other => panic!("expected SandboxTrap, got {:?}", other.map(|_| ())),
    }

    // the trap poisons nothing: the next evaluation rewinds the heap and runs
    let out = policy.evaluate("7").unwrap();
    assert_eq!(serde_json::from_str::<Value>(&out).unwrap(), json!(7));
}

#[test]
fn test_malformed_input() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);

    assert!(matches!(
        policy.evaluate("!this is rejected by the guest parser"),
        Err(OpaError::MalformedInput)
    ));
    assert!(matches!(policy.evaluate(""), Err(OpaError::MalformedInput)));
    assert!(matches!(
        policy.set_data("!rejected"),
        Err(OpaError::MalformedInput)
    ));
}

#[test]
fn test_fast_evaluate() {
    let sandbox = sandbox();
    let mut policy = mock_policy(&sandbox);
    policy.set_data(r#"{"k":"v"}"#).unwrap();

    let out = policy.fast_evaluate(r#"{"message":"world"}"#).unwrap();
    assert_eq!(
        serde_json::from_str::<Value>(&out).unwrap(),
        json!({"message": "world"})
    );
}

#[test]
fn test_abi_gate_rejects_major_two() {
    let sandbox = sandbox();
    let wat = MOCK_WAT.replace(ABI_MAJOR_LINE, &ABI_MAJOR_LINE.replace("i32.const 1", "i32.const 2"));
    assert_ne!(wat, MOCK_WAT, "version global line must exist to rewrite");

    match OpaPolicy::from_bytes(&sandbox, "mock_policy_v2", &wat) {
        Err(OpaError::UnsupportedAbiVersion(2)) => {}
        other => panic!(
            "expected UnsupportedAbiVersion(2), got {:?}",
            other.map(|_| ())
        ),
    }
}

#[test]
fn test_module_without_version_globals_is_accepted() {
    let sandbox = sandbox();
    let wat = MOCK_WAT.replace(ABI_MAJOR_LINE, "").replace(ABI_MINOR_LINE, "");

    let mut policy =
        OpaPolicy::from_bytes(&sandbox, "mock_policy_legacy", &wat).expect("legacy module");
    assert!(policy.abi_version().is_none());
    assert!(policy.evaluate("1").is_ok());
}

#[test]
fn test_shared_module_backs_independent_evaluators() {
    let sandbox = sandbox();
    let module = sandbox
        .load_module_bytes("mock_policy", MOCK_WAT)
        .expect("failed to load module");

    let mut a = OpaPolicy::new(&sandbox, &module).unwrap();
    let mut b = OpaPolicy::new(&sandbox, &module).unwrap();

    a.set_data(r#"{"who":"a"}"#).unwrap();
    b.set_data(r#"{"who":"b"}"#).unwrap();

    let out_a = a.evaluate_at("example/data", "null").unwrap();
    let out_b = b.evaluate_at("example/data", "null").unwrap();
    assert_eq!(serde_json::from_str::<Value>(&out_a).unwrap(), json!({"who": "a"}));
    assert_eq!(serde_json::from_str::<Value>(&out_b).unwrap(), json!({"who": "b"}));
}
