//! WebAssembly policy evaluation.
//!
//! This module implements the host half of the OPA wasm ABI on top of
//! wasmtime: module loading, import linking, the memory bridge that moves
//! JSON across the sandbox boundary, builtin dispatch, and the per-instance
//! evaluator state machine.
//!
//! ## Isolation model
//!
//! - **Memory isolation**: each policy instance runs in its own linear
//!   memory; addresses are offsets that never leave the sandbox.
//! - **Capability-based**: the module reaches the host only through the
//!   imports defined here (abort + builtin call-backs).
//! - **Synchronous**: evaluation runs to completion on the caller's thread;
//!   builtin call-backs execute reentrantly on the same stack.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opa_sandbox::{OpaSandbox, OpaConfig, OpaPolicy};
//!
//! let sandbox = OpaSandbox::new(OpaConfig::default())?;
//! let module = sandbox.load_module("policy.wasm")?;
//!
//! let mut policy = OpaPolicy::new(&sandbox, &module)?;
//! policy.set_data(r#"{"world": "world"}"#)?;
//! let result = policy.evaluate(r#"{"message": "world"}"#)?;
//! ```

pub mod abi;
mod config;
mod host;
mod policy;
mod runtime;

pub use abi::AbiVersion;
pub use config::OpaConfig;
pub use policy::{EntrypointRef, OpaPolicy};
pub use runtime::{OpaModule, OpaSandbox};
