//! The per-instance policy evaluator.
//!
//! An [`OpaPolicy`] owns one instantiated module, one execution context and
//! one linear memory region. Evaluators are independent memory spaces: the
//! compiled [`super::OpaModule`] may be shared, the evaluator never is.
//!
//! ## Heap discipline
//!
//! The guest allocator is a bump pointer. Two watermarks are snapshotted and
//! explicitly rewound, never garbage-collected:
//!
//! - `base`: the allocator position right after initialization, before any
//!   data document is loaded. `set_data` rewinds here.
//! - `data`: the position right after the current data document. Every
//!   evaluation rewinds here first, so scratch allocations from one call are
//!   reclaimed before the next begins.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use wasmtime::{
    ExternType, Instance, Linker, Memory, MemoryType, Module, Store, StoreLimitsBuilder,
    TypedFunc, Val, WasmParams, WasmResults,
};

use super::abi::{self, AbiVersion};
use super::host::{self, GuestExports, HostState};
use super::runtime::{OpaModule, OpaSandbox};
use crate::builtins::BuiltinRegistry;
use crate::error::{OpaError, Result};

/// Bump-allocator watermarks. Both only move forward within a generation;
/// rewinding is explicit. Invariant: `data >= base`.
#[derive(Debug, Clone, Copy, Default)]
struct HeapCheckpoints {
    base: i32,
    data: i32,
}

impl HeapCheckpoints {
    fn new(base: i32) -> Self {
        Self { base, data: base }
    }

    fn record_data(&mut self, ptr: i32) {
        debug_assert!(ptr >= self.base);
        self.data = ptr;
    }
}

/// An entrypoint selector: a stable numeric id or a path name like
/// `"example/allow"`.
#[derive(Debug, Clone, Copy)]
pub enum EntrypointRef<'a> {
    /// Numeric id as assigned by the policy compiler
    Id(i32),
    /// Entrypoint path name
    Name(&'a str),
}

impl From<i32> for EntrypointRef<'static> {
    fn from(id: i32) -> Self {
        EntrypointRef::Id(id)
    }
}

impl<'a> From<&'a str> for EntrypointRef<'a> {
    fn from(name: &'a str) -> Self {
        EntrypointRef::Name(name)
    }
}

/// One instantiated policy, ready to evaluate.
pub struct OpaPolicy {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    bridge: GuestExports,

    heap_ptr_get: TypedFunc<(), i32>,
    heap_ptr_set: TypedFunc<i32, ()>,
    eval_ctx_new: TypedFunc<(), i32>,
    eval_ctx_set_input: TypedFunc<(i32, i32), ()>,
    eval_ctx_set_data: TypedFunc<(i32, i32), ()>,
    eval_ctx_set_entrypoint: TypedFunc<(i32, i32), ()>,
    eval_ctx_get_result: TypedFunc<i32, i32>,
    eval: TypedFunc<i32, i32>,

    entrypoints: HashMap<String, i32>,
    data_addr: i32,
    heap: HeapCheckpoints,
    abi_version: Option<AbiVersion>,
}

impl OpaPolicy {
    /// Instantiate a precompiled module against the default builtin
    /// registry.
    pub fn new(sandbox: &OpaSandbox, module: &OpaModule) -> Result<Self> {
        Self::with_registry(sandbox, module, BuiltinRegistry::global())
    }

    /// Load and instantiate a policy from a `.wasm` file. Incurs the
    /// compilation cost; prefer [`OpaPolicy::new`] with a cached module when
    /// constructing many evaluators.
    pub fn from_file(sandbox: &OpaSandbox, path: impl AsRef<Path>) -> Result<Self> {
        let module = sandbox.load_module(path)?;
        Self::new(sandbox, &module)
    }

    /// Load and instantiate a policy from an in-memory byte buffer.
    pub fn from_bytes(sandbox: &OpaSandbox, name: &str, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let module = sandbox.load_module_bytes(name, bytes)?;
        Self::new(sandbox, &module)
    }

    /// Instantiate with an explicit builtin registry instead of the
    /// process-wide default.
    pub fn with_registry(
        sandbox: &OpaSandbox,
        module: &OpaModule,
        registry: Arc<BuiltinRegistry>,
    ) -> Result<Self> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(sandbox.config().max_memory)
            .build();
        let mut store = Store::new(sandbox.engine(), HostState::new(registry, limits));
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = sandbox.config().fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| OpaError::Wasm(format!("fuel setup failed: {}", e)))?;
        }

        let memory = Memory::new(&mut store, declared_memory_type(&module.module)?)
            .map_err(|e| OpaError::Wasm(format!("memory creation failed: {}", e)))?;
        store.data_mut().memory = Some(memory);

        let mut linker: Linker<HostState> = Linker::new(sandbox.engine());
        host::link_imports(&mut linker, &mut store, memory)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| OpaError::Wasm(format!("instantiation failed: {}", e)))?;

        let bridge = GuestExports {
            malloc: get_typed(&instance, &mut store, abi::MALLOC)?,
            json_parse: get_typed(&instance, &mut store, abi::JSON_PARSE)?,
            json_dump: get_typed(&instance, &mut store, abi::JSON_DUMP)?,
        };
        store.data_mut().guest = Some(bridge.clone());

        let mut policy = Self {
            heap_ptr_get: get_typed(&instance, &mut store, abi::HEAP_PTR_GET)?,
            heap_ptr_set: get_typed(&instance, &mut store, abi::HEAP_PTR_SET)?,
            eval_ctx_new: get_typed(&instance, &mut store, abi::EVAL_CTX_NEW)?,
            eval_ctx_set_input: get_typed(&instance, &mut store, abi::EVAL_CTX_SET_INPUT)?,
            eval_ctx_set_data: get_typed(&instance, &mut store, abi::EVAL_CTX_SET_DATA)?,
            eval_ctx_set_entrypoint: get_typed(&instance, &mut store, abi::EVAL_CTX_SET_ENTRYPOINT)?,
            eval_ctx_get_result: get_typed(&instance, &mut store, abi::EVAL_CTX_GET_RESULT)?,
            eval: get_typed(&instance, &mut store, abi::EVAL)?,
            store,
            instance,
            memory,
            bridge,
            entrypoints: HashMap::new(),
            data_addr: 0,
            heap: HeapCheckpoints::default(),
            abi_version: None,
        };
        policy.initialize()?;
        Ok(policy)
    }

    /// One-time setup: metadata decode, initial empty data document, heap
    /// snapshots, ABI gate. Runs to completion or the whole construction
    /// fails; there is no partially initialized evaluator.
    fn initialize(&mut self) -> Result<()> {
        let builtins_fn: TypedFunc<(), i32> =
            get_typed(&self.instance, &mut self.store, abi::BUILTINS_METADATA)?;
        let addr = builtins_fn
            .call(&mut self.store, ())
            .map_err(|e| self.guest_error(e))?;
        let builtins_json = self.dump_json(addr)?;
        self.store.data_mut().builtin_ids = abi::parse_builtin_ids(&builtins_json)?;

        self.data_addr = self.load_json("{}")?;
        self.heap = HeapCheckpoints::new(self.heap_ptr()?);

        let entrypoints_fn: TypedFunc<(), i32> =
            get_typed(&self.instance, &mut self.store, abi::ENTRYPOINTS_METADATA)?;
        let addr = entrypoints_fn
            .call(&mut self.store, ())
            .map_err(|e| self.guest_error(e))?;
        let entrypoints_json = self.dump_json(addr)?;
        self.entrypoints = abi::parse_entrypoints(&entrypoints_json)?;

        self.abi_version = self.read_abi_version();
        if let Some(version) = self.abi_version {
            version.check()?;
        }

        tracing::debug!(
            entrypoints = self.entrypoints.len(),
            builtins = self.store.data().builtin_ids.len(),
            base_heap = self.heap.base,
            "policy initialized"
        );
        Ok(())
    }

    /// Replace the policy's base data document.
    ///
    /// Rewinds the allocator to the base watermark, discarding the previous
    /// document and any evaluation scratch above it. Idempotent: loading
    /// identical content twice lands at the identical address and watermark.
    pub fn set_data(&mut self, json: &str) -> Result<()> {
        self.set_heap_ptr(self.heap.base)?;
        self.data_addr = self.load_json(json)?;
        let watermark = self.heap_ptr()?;
        self.heap.record_data(watermark);
        tracing::debug!(addr = self.data_addr, heap = self.heap.data, "data document loaded");
        Ok(())
    }

    /// Evaluate the module's default entrypoint against `input`.
    pub fn evaluate(&mut self, input: &str) -> Result<String> {
        self.run_eval(input, None)
    }

    /// Evaluate a specific entrypoint, selected by numeric id or name.
    pub fn evaluate_at<'a>(
        &mut self,
        entrypoint: impl Into<EntrypointRef<'a>>,
        input: &str,
    ) -> Result<String> {
        let id = self.resolve_entrypoint(entrypoint.into())?;
        self.run_eval(input, Some(id))
    }

    /// Reduced-overhead evaluation via the combined `opa_eval` export
    /// (ABI 1.2).
    ///
    /// Writes the input bytes straight at the data watermark and skips the
    /// context-object machinery. No guest-side parse-failure signal exists
    /// on this path; callers must supply well-formed JSON and accept looser
    /// diagnostics.
    pub fn fast_evaluate(&mut self, input: &str) -> Result<String> {
        let opa_eval: TypedFunc<(i32, i32, i32, i32, i32, i32, i32), i32> = self
            .instance
            .get_typed_func(&mut self.store, abi::OPA_EVAL)
            .map_err(|e| {
                OpaError::Wasm(format!(
                    "fast path requires the `{}` export: {}",
                    abi::OPA_EVAL,
                    e
                ))
            })?;

        let input_addr = self.heap.data;
        let input_len = input.len() as i32;
        self.memory
            .write(&mut self.store, input_addr as usize, input.as_bytes())
            .map_err(|e| OpaError::Memory(format!("write at {}: {}", input_addr, e)))?;

        let result_addr = opa_eval
            .call(
                &mut self.store,
                (
                    0, // reserved context
                    0, // default entrypoint
                    self.data_addr,
                    input_addr,
                    input_len,
                    input_addr + input_len, // scratch heap starts past the input
                    0, // result format: JSON
                ),
            )
            .map_err(|e| self.guest_error(e))?;

        host::read_c_string(&self.store, &self.memory, result_addr)
    }

    /// The entrypoint table (name -> numeric id) the module exported.
    pub fn entrypoints(&self) -> &HashMap<String, i32> {
        &self.entrypoints
    }

    /// Builtin id -> name mapping the module exported.
    pub fn builtins(&self) -> &HashMap<i32, String> {
        &self.store.data().builtin_ids
    }

    /// ABI version advertised by the module, if any.
    pub fn abi_version(&self) -> Option<AbiVersion> {
        self.abi_version
    }

    /// Address of the active data document. Diagnostic.
    pub fn data_address(&self) -> i32 {
        self.data_addr
    }

    /// The (base, data) heap watermarks. Diagnostic.
    pub fn heap_watermarks(&self) -> (i32, i32) {
        (self.heap.base, self.heap.data)
    }

    /// The guest allocator's current position. Diagnostic.
    pub fn current_heap_ptr(&mut self) -> Result<i32> {
        self.heap_ptr()
    }

    fn resolve_entrypoint(&self, entrypoint: EntrypointRef<'_>) -> Result<i32> {
        match entrypoint {
            EntrypointRef::Name(name) => self
                .entrypoints
                .get(name)
                .copied()
                .ok_or_else(|| OpaError::UnknownEntrypoint(name.to_string())),
            EntrypointRef::Id(id) => {
                if self.entrypoints.values().any(|&known| known == id) {
                    Ok(id)
                } else {
                    Err(OpaError::UnknownEntrypoint(id.to_string()))
                }
            }
        }
    }

    fn run_eval(&mut self, input: &str, entrypoint: Option<i32>) -> Result<String> {
        // Reclaim the previous evaluation's scratch before loading anything
        self.set_heap_ptr(self.heap.data)?;
        let input_addr = self.load_json(input)?;

        let ctx = self
            .eval_ctx_new
            .call(&mut self.store, ())
            .map_err(|e| self.guest_error(e))?;
        self.eval_ctx_set_input
            .call(&mut self.store, (ctx, input_addr))
            .map_err(|e| self.guest_error(e))?;
        self.eval_ctx_set_data
            .call(&mut self.store, (ctx, self.data_addr))
            .map_err(|e| self.guest_error(e))?;
        if let Some(id) = entrypoint {
            self.eval_ctx_set_entrypoint
                .call(&mut self.store, (ctx, id))
                .map_err(|e| self.guest_error(e))?;
        }

        let rc = self
            .eval
            .call(&mut self.store, ctx)
            .map_err(|e| self.guest_error(e))?;
        if rc != 0 {
            return Err(OpaError::Wasm(format!("eval returned {}", rc)));
        }

        let result_addr = self
            .eval_ctx_get_result
            .call(&mut self.store, ctx)
            .map_err(|e| self.guest_error(e))?;
        self.dump_json(result_addr)
    }

    fn load_json(&mut self, json: &str) -> Result<i32> {
        host::load_json(&mut self.store, &self.memory, &self.bridge, json)
    }

    fn dump_json(&mut self, addr: i32) -> Result<String> {
        host::dump_json(&mut self.store, &self.memory, &self.bridge, addr)
    }

    fn heap_ptr(&mut self) -> Result<i32> {
        self.heap_ptr_get
            .call(&mut self.store, ())
            .map_err(|e| OpaError::Wasm(format!("{} failed: {}", abi::HEAP_PTR_GET, e)))
    }

    fn set_heap_ptr(&mut self, ptr: i32) -> Result<()> {
        self.heap_ptr_set
            .call(&mut self.store, ptr)
            .map_err(|e| OpaError::Wasm(format!("{} failed: {}", abi::HEAP_PTR_SET, e)))
    }

    fn read_abi_version(&mut self) -> Option<AbiVersion> {
        let major = self.read_global_i32(abi::ABI_VERSION)?;
        let minor = self.read_global_i32(abi::ABI_MINOR_VERSION);
        Some(AbiVersion { major, minor })
    }

    fn read_global_i32(&mut self, name: &str) -> Option<i32> {
        let global = self.instance.get_global(&mut self.store, name)?;
        match global.get(&mut self.store) {
            Val::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Turn a guest call failure into the typed error behind it: a builtin
    /// dispatch failure or abort recorded in the store wins over the raw
    /// engine trap.
    fn guest_error(&mut self, err: wasmtime::Error) -> OpaError {
        if let Some(pending) = self.store.data_mut().pending_error.take() {
            return pending;
        }
        OpaError::Wasm(format!("{}", err))
    }
}

/// Typed export lookup with the export name in the error.
fn get_typed<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| OpaError::Wasm(format!("export `{}` not found: {}", name, e)))
}

/// The memory type the module declares for its `env.memory` import.
fn declared_memory_type(module: &Module) -> Result<MemoryType> {
    for import in module.imports() {
        if import.module() == abi::IMPORT_MODULE && import.name() == abi::MEMORY {
            if let ExternType::Memory(ty) = import.ty() {
                return Ok(ty);
            }
        }
    }
    Err(OpaError::Wasm(format!(
        "module does not import {}.{}",
        abi::IMPORT_MODULE,
        abi::MEMORY
    )))
}
