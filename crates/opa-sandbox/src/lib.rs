//! # opa-sandbox
//!
//! Open Policy Agent WASM policy evaluation in a wasmtime sandbox.
//!
//! This crate runs policies compiled to WebAssembly (`opa build -t wasm`)
//! inside an isolated linear-memory sandbox. It implements the host side of
//! the OPA wasm ABI: the bump-allocator heap protocol, JSON marshaling
//! across the memory boundary, the numeric builtin dispatch table reachable
//! from sandboxed call-backs, multi-entrypoint evaluation, and ABI version
//! negotiation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opa_sandbox::{OpaSandbox, OpaConfig, OpaPolicy};
//!
//! let sandbox = OpaSandbox::new(OpaConfig::default())?;
//! let module = sandbox.load_module("policy.wasm")?;
//!
//! // One compiled module can back many independent evaluators.
//! let mut policy = OpaPolicy::new(&sandbox, &module)?;
//! policy.set_data(r#"{"user_roles": {"alice": ["admin"]}}"#)?;
//!
//! let result = policy.evaluate(r#"{"user": "alice", "action": "read"}"#)?;
//! let by_name = policy.evaluate_at("rbac/allow", r#"{"user": "alice"}"#)?;
//! ```
//!
//! ## Concurrency
//!
//! An [`OpaPolicy`] is a single-threaded island: evaluation takes `&mut
//! self` and runs to completion. For concurrent evaluation, instantiate one
//! policy per caller from the same [`OpaModule`] — compilation is paid once.
//!
//! ## Builtins
//!
//! Policies may call host functions they cannot compute themselves. The
//! [`builtins::BuiltinRegistry`] maps builtin names to handlers; it is
//! assembled from a static catalog before any policy runs and is read-only
//! afterwards. See [`builtins`] for the registration surface.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builtins;
pub mod error;
pub mod wasm;

// Re-export main types
pub use builtins::{Builtin, BuiltinRegistry, ParamType};
pub use error::{OpaError, Result};
pub use wasm::{AbiVersion, EntrypointRef, OpaConfig, OpaModule, OpaPolicy, OpaSandbox};
