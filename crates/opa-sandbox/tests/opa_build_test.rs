//! End-to-end test against a genuine compiled policy.
//!
//! Requires `tests/testdata/policy.wasm`, produced with the OPA toolchain
//! from the hello-world policy:
//!
//! ```rego
//! package example
//! default result = false
//! result { input.message == data.world }
//! ```
//!
//! ```text
//! opa build -t wasm -e example/result -o bundle.tar.gz policy.rego
//! tar xzf bundle.tar.gz /policy.wasm
//! ```
//!
//! The test is skipped when the artifact is absent so the suite does not
//! depend on the external toolchain.

use std::path::Path;

use opa_sandbox::{OpaConfig, OpaPolicy, OpaSandbox};
use serde_json::Value;

const POLICY_WASM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/testdata/policy.wasm");

#[test]
fn test_hello_world_policy() {
    if !Path::new(POLICY_WASM).exists() {
        eprintln!("skipping: {} not present", POLICY_WASM);
        return;
    }

    let sandbox = OpaSandbox::new(OpaConfig::default()).expect("failed to create sandbox");
    let mut policy = OpaPolicy::from_file(&sandbox, POLICY_WASM).expect("failed to load policy");

    policy.set_data(r#"{"world": "world"}"#).expect("set_data failed");

    let output = policy
        .evaluate(r#"{"message": "world"}"#)
        .expect("evaluate failed");

    // result shape: [{"result": <value>}]
    let parsed: Value = serde_json::from_str(&output).expect("result is JSON");
    let result = parsed
        .as_array()
        .and_then(|a| a.first())
        .and_then(|entry| entry.get("result"))
        .expect("single-entry result array");
    assert_eq!(result, &Value::Bool(true));

    // a non-matching input flips the rule
    let output = policy
        .evaluate(r#"{"message": "not the world"}"#)
        .expect("evaluate failed");
    let parsed: Value = serde_json::from_str(&output).expect("result is JSON");
    let result = parsed
        .as_array()
        .and_then(|a| a.first())
        .and_then(|entry| entry.get("result"))
        .expect("single-entry result array");
    assert_eq!(result, &Value::Bool(false));
}
