//! The OPA wasm ABI surface.
//!
//! Names of the imports a compiled policy expects and the exports it
//! provides, plus decoding of the metadata documents (`builtins`,
//! `entrypoints`) and the optional ABI version globals.
//!
//! The import side of the contract, as seen from the module:
//!
//! ```wat
//! (import "env" "memory" (memory 2))
//! (import "env" "opa_abort" (func (param i32)))
//! (import "env" "opa_builtin0" (func (param i32 i32) (result i32)))
//! (import "env" "opa_builtin1" (func (param i32 i32 i32) (result i32)))
//! (import "env" "opa_builtin2" (func (param i32 i32 i32 i32) (result i32)))
//! (import "env" "opa_builtin3" (func (param i32 i32 i32 i32 i32) (result i32)))
//! (import "env" "opa_builtin4" (func (param i32 i32 i32 i32 i32 i32) (result i32)))
//! ```

use crate::error::{OpaError, Result};
use std::collections::HashMap;

/// Import module name every host-provided item lives under.
pub const IMPORT_MODULE: &str = "env";
/// Linear memory import name.
pub const MEMORY: &str = "memory";
/// Abort call-back import name.
pub const ABORT: &str = "opa_abort";
/// Builtin call-back import names, indexed by arity.
pub const BUILTINS: [&str; 5] = [
    "opa_builtin0",
    "opa_builtin1",
    "opa_builtin2",
    "opa_builtin3",
    "opa_builtin4",
];

/// Allocator export.
pub const MALLOC: &str = "opa_malloc";
/// JSON parse export.
pub const JSON_PARSE: &str = "opa_json_parse";
/// JSON serialize export.
pub const JSON_DUMP: &str = "opa_json_dump";
/// Heap pointer read export.
pub const HEAP_PTR_GET: &str = "opa_heap_ptr_get";
/// Heap pointer write export.
pub const HEAP_PTR_SET: &str = "opa_heap_ptr_set";
/// Evaluation context constructor export.
pub const EVAL_CTX_NEW: &str = "opa_eval_ctx_new";
/// Evaluation context input setter export.
pub const EVAL_CTX_SET_INPUT: &str = "opa_eval_ctx_set_input";
/// Evaluation context data setter export.
pub const EVAL_CTX_SET_DATA: &str = "opa_eval_ctx_set_data";
/// Evaluation context entrypoint setter export.
pub const EVAL_CTX_SET_ENTRYPOINT: &str = "opa_eval_ctx_set_entrypoint";
/// Evaluation context result getter export.
pub const EVAL_CTX_GET_RESULT: &str = "opa_eval_ctx_get_result";
/// Evaluation entry export.
pub const EVAL: &str = "eval";
/// Combined one-shot evaluation export (ABI 1.2, fast path).
pub const OPA_EVAL: &str = "opa_eval";
/// Builtins metadata export.
pub const BUILTINS_METADATA: &str = "builtins";
/// Entrypoints metadata export.
pub const ENTRYPOINTS_METADATA: &str = "entrypoints";
/// ABI major version global.
pub const ABI_VERSION: &str = "opa_wasm_abi_version";
/// ABI minor version global.
pub const ABI_MINOR_VERSION: &str = "opa_wasm_abi_minor_version";

/// The only ABI major version this runtime speaks.
pub const SUPPORTED_ABI_MAJOR: i32 = 1;

/// ABI version pair read from the module's exported globals.
///
/// Modules compiled before version negotiation export neither global; such
/// modules are accepted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiVersion {
    /// Major version; must equal [`SUPPORTED_ABI_MAJOR`]
    pub major: i32,
    /// Minor version, if exported
    pub minor: Option<i32>,
}

impl AbiVersion {
    /// Gate on the major version. Called once at evaluator construction.
    pub fn check(&self) -> Result<()> {
        if self.major != SUPPORTED_ABI_MAJOR {
            return Err(OpaError::UnsupportedAbiVersion(self.major));
        }
        Ok(())
    }
}

/// Decode the `entrypoints` metadata document.
///
/// Format: a JSON object mapping entrypoint path to numeric id, e.g.
/// `{"example":0,"example/one":1}`.
pub fn parse_entrypoints(json: &str) -> Result<HashMap<String, i32>> {
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| OpaError::InvalidMetadata(format!("entrypoints: {}", e)))?;

    let mut table = HashMap::with_capacity(doc.len());
    for (name, id) in doc {
        let id = id
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                OpaError::InvalidMetadata(format!("entrypoints: non-integer id for `{}`", name))
            })?;
        table.insert(name, id);
    }
    Ok(table)
}

/// Decode the `builtins` metadata document into an id -> name map.
///
/// The module publishes name -> id; dispatch needs the inverse.
pub fn parse_builtin_ids(json: &str) -> Result<HashMap<i32, String>> {
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| OpaError::InvalidMetadata(format!("builtins: {}", e)))?;

    let mut map = HashMap::with_capacity(doc.len());
    for (name, id) in doc {
        let id = id
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                OpaError::InvalidMetadata(format!("builtins: non-integer id for `{}`", name))
            })?;
        map.insert(id, name);
    }
    Ok(map)
}
