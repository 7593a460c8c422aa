//! Host side of the sandbox boundary.
//!
//! Defines the import table a policy module expects (`env.memory`,
//! `opa_abort`, `opa_builtin0`..`opa_builtin4`) and the dispatch path that
//! resolves a builtin id to a registered handler, decodes its arguments out
//! of sandbox memory, and writes the result back in.
//!
//! Builtin call-backs run reentrantly on the evaluation stack: the guest is
//! mid-`eval` when they fire, and they call back into the guest's own
//! exports to move JSON across the boundary. A dispatch failure therefore
//! cannot return a result address; it records a typed error in [`HostState`]
//! and traps, aborting the evaluation. The evaluator converts the trap back
//! into the recorded error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use wasmtime::{AsContext, AsContextMut, Caller, Linker, Memory, StoreLimits, TypedFunc};

use super::abi;
use crate::builtins::BuiltinRegistry;
use crate::error::{OpaError, Result};

/// Typed handles to the guest exports the memory bridge calls.
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub malloc: TypedFunc<i32, i32>,
    pub json_parse: TypedFunc<(i32, i32), i32>,
    pub json_dump: TypedFunc<i32, i32>,
}

/// Store data for one policy instance.
pub(crate) struct HostState {
    /// Builtin name -> descriptor registry this instance dispatches against
    pub registry: Arc<BuiltinRegistry>,
    /// Module-assigned builtin id -> name, decoded at initialization
    pub builtin_ids: HashMap<i32, String>,
    /// The host-created linear memory, bound after store creation
    pub memory: Option<Memory>,
    /// Guest exports, bound after instantiation
    pub guest: Option<GuestExports>,
    /// Typed error recorded by a failed call-back, surfaced by the evaluator
    pub pending_error: Option<OpaError>,
    /// Resource limits enforced by the store
    pub limits: StoreLimits,
}

impl HostState {
    pub fn new(registry: Arc<BuiltinRegistry>, limits: StoreLimits) -> Self {
        Self {
            registry,
            builtin_ids: HashMap::new(),
            memory: None,
            guest: None,
            pending_error: None,
            limits,
        }
    }
}

/// Define every import the policy module expects.
pub(crate) fn link_imports(
    linker: &mut Linker<HostState>,
    mut store: impl AsContextMut<Data = HostState>,
    memory: Memory,
) -> Result<()> {
    linker
        .define(&mut store, abi::IMPORT_MODULE, abi::MEMORY, memory)
        .map_err(|e| OpaError::Wasm(format!("failed to define memory import: {}", e)))?;

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::ABORT,
            |mut caller: Caller<'_, HostState>, addr: i32| -> wasmtime::Result<()> {
                let message = read_abort_message(&mut caller, addr);
                tracing::warn!("policy module aborted: {}", message);
                caller.data_mut().pending_error = Some(OpaError::SandboxTrap(message));
                Err(wasmtime::Error::msg(abi::ABORT))
            },
        )
        .map_err(|e| OpaError::Wasm(format!("failed to register {}: {}", abi::ABORT, e)))?;

    register_builtin_stubs(linker)?;
    Ok(())
}

/// One stub per supported arity; every stub funnels into [`dispatch`].
fn register_builtin_stubs(linker: &mut Linker<HostState>) -> Result<()> {
    let stub_err =
        |name: &str, e: wasmtime::Error| OpaError::Wasm(format!("failed to register {}: {}", name, e));

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::BUILTINS[0],
            |mut caller: Caller<'_, HostState>, id: i32, _ctx: i32| -> wasmtime::Result<i32> {
                dispatch(&mut caller, id, &[])
            },
        )
        .map_err(|e| stub_err(abi::BUILTINS[0], e))?;

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::BUILTINS[1],
            |mut caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             a1: i32|
             -> wasmtime::Result<i32> { dispatch(&mut caller, id, &[a1]) },
        )
        .map_err(|e| stub_err(abi::BUILTINS[1], e))?;

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::BUILTINS[2],
            |mut caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             a1: i32,
             a2: i32|
             -> wasmtime::Result<i32> { dispatch(&mut caller, id, &[a1, a2]) },
        )
        .map_err(|e| stub_err(abi::BUILTINS[2], e))?;

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::BUILTINS[3],
            |mut caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             a1: i32,
             a2: i32,
             a3: i32|
             -> wasmtime::Result<i32> { dispatch(&mut caller, id, &[a1, a2, a3]) },
        )
        .map_err(|e| stub_err(abi::BUILTINS[3], e))?;

    linker
        .func_wrap(
            abi::IMPORT_MODULE,
            abi::BUILTINS[4],
            |mut caller: Caller<'_, HostState>,
             id: i32,
             _ctx: i32,
             a1: i32,
             a2: i32,
             a3: i32,
             a4: i32|
             -> wasmtime::Result<i32> { dispatch(&mut caller, id, &[a1, a2, a3, a4]) },
        )
        .map_err(|e| stub_err(abi::BUILTINS[4], e))?;

    Ok(())
}

/// Call-back entry: trap on any failure, recording the typed cause first.
fn dispatch(
    caller: &mut Caller<'_, HostState>,
    id: i32,
    arg_addrs: &[i32],
) -> wasmtime::Result<i32> {
    match try_dispatch(caller, id, arg_addrs) {
        Ok(addr) => Ok(addr),
        Err(err) => {
            tracing::debug!("builtin dispatch failed: {}", err);
            caller.data_mut().pending_error = Some(err);
            Err(wasmtime::Error::msg("builtin dispatch failed"))
        }
    }
}

fn try_dispatch(caller: &mut Caller<'_, HostState>, id: i32, arg_addrs: &[i32]) -> Result<i32> {
    let (name, registry) = {
        let state = caller.data();
        let name = state
            .builtin_ids
            .get(&id)
            .cloned()
            .ok_or(OpaError::UnknownBuiltinId(id))?;
        (name, state.registry.clone())
    };
    let builtin = registry
        .get(&name)
        .ok_or_else(|| OpaError::UnsupportedBuiltin(name.clone()))?;

    if builtin.params().len() > arg_addrs.len() {
        return Err(OpaError::BuiltinArityMismatch {
            name: name.clone(),
            expected: builtin.params().len(),
            given: arg_addrs.len(),
        });
    }

    let (memory, guest) = bridge_parts(caller)?;
    let mut args = Vec::with_capacity(builtin.params().len());
    for (index, (param, addr)) in builtin.params().iter().zip(arg_addrs).enumerate() {
        let json = dump_json(&mut *caller, &memory, &guest, *addr)?;
        let value: Value =
            serde_json::from_str(&json).map_err(|e| OpaError::BuiltinArgumentDecode {
                name: name.clone(),
                index,
                reason: e.to_string(),
            })?;
        if !param.matches(&value) {
            return Err(OpaError::BuiltinArgumentDecode {
                name: name.clone(),
                index,
                reason: format!("expected {}, got {}", param.name(), json_type(&value)),
            });
        }
        args.push(value);
    }

    let result = builtin.invoke(&args)?;
    let encoded = serde_json::to_string(&result).map_err(|e| OpaError::BuiltinExecution {
        name,
        reason: format!("result encoding failed: {}", e),
    })?;
    load_json(&mut *caller, &memory, &guest, &encoded)
}

fn bridge_parts(caller: &Caller<'_, HostState>) -> Result<(Memory, GuestExports)> {
    let state = caller.data();
    let memory = state
        .memory
        .ok_or_else(|| OpaError::Wasm("linear memory not bound".into()))?;
    let guest = state
        .guest
        .clone()
        .ok_or_else(|| OpaError::Wasm("guest exports not bound".into()))?;
    Ok((memory, guest))
}

/// Serialize `json` into sandbox memory and parse it guest-side, returning
/// the parsed value's address. A zero address from the parser means the
/// document was rejected.
pub(crate) fn load_json(
    mut ctx: impl AsContextMut<Data = HostState>,
    memory: &Memory,
    guest: &GuestExports,
    json: &str,
) -> Result<i32> {
    let len = json.len() as i32;
    let addr = guest
        .malloc
        .call(&mut ctx, len)
        .map_err(|e| OpaError::Wasm(format!("{} failed: {}", abi::MALLOC, e)))?;
    memory
        .write(&mut ctx, addr as usize, json.as_bytes())
        .map_err(|e| OpaError::Memory(format!("write at {}: {}", addr, e)))?;

    let parsed = guest
        .json_parse
        .call(&mut ctx, (addr, len))
        .map_err(|e| OpaError::Wasm(format!("{} failed: {}", abi::JSON_PARSE, e)))?;
    if parsed == 0 {
        return Err(OpaError::MalformedInput);
    }
    Ok(parsed)
}

/// Serialize the value at `addr` guest-side and read it out as a string.
pub(crate) fn dump_json(
    mut ctx: impl AsContextMut<Data = HostState>,
    memory: &Memory,
    guest: &GuestExports,
    addr: i32,
) -> Result<String> {
    let str_addr = guest
        .json_dump
        .call(&mut ctx, addr)
        .map_err(|e| OpaError::Wasm(format!("{} failed: {}", abi::JSON_DUMP, e)))?;
    read_c_string(&ctx, memory, str_addr)
}

/// Read the NUL-terminated UTF-8 string at `addr`.
pub(crate) fn read_c_string(
    ctx: impl AsContext<Data = HostState>,
    memory: &Memory,
    addr: i32,
) -> Result<String> {
    let data = memory.data(&ctx);
    let start = addr as usize;
    if start >= data.len() {
        return Err(OpaError::Memory(format!(
            "string address {} out of bounds",
            addr
        )));
    }
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| OpaError::Memory("unterminated string in sandbox memory".into()))?;
    String::from_utf8(data[start..end].to_vec())
        .map_err(|e| OpaError::Memory(format!("invalid UTF-8 in sandbox memory: {}", e)))
}

fn read_abort_message(caller: &mut Caller<'_, HostState>, addr: i32) -> String {
    let Some(memory) = caller.data().memory else {
        return "policy aborted".to_string();
    };
    read_c_string(&*caller, &memory, addr).unwrap_or_else(|_| "policy aborted".to_string())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
