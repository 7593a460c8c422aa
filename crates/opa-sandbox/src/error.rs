//! Error types for the policy sandbox crate.

use thiserror::Error;

/// Policy sandbox error type
#[derive(Error, Debug)]
pub enum OpaError {
    /// Policy bytecode was malformed or failed engine validation
    #[error("policy compilation failed: {0}")]
    Compilation(String),

    /// Module declares an ABI major version this runtime does not speak
    #[error("unsupported wasm ABI version {0} (supported: 1)")]
    UnsupportedAbiVersion(i32),

    /// Requested entrypoint is not in the module's entrypoint table
    #[error("unknown entrypoint: {0}")]
    UnknownEntrypoint(String),

    /// A JSON document failed to parse inside the sandbox
    #[error("input JSON rejected by the policy module")]
    MalformedInput,

    /// Module invoked a builtin id absent from its own builtins metadata
    #[error("unknown builtin id: {0}")]
    UnknownBuiltinId(i32),

    /// Module requires a builtin the host registry does not implement
    #[error("builtin `{0}` is not supported by this host")]
    UnsupportedBuiltin(String),

    /// Builtin invoked with fewer arguments than it declares
    #[error("builtin `{name}` expects {expected} arguments, received {given}")]
    BuiltinArityMismatch {
        /// Builtin name
        name: String,
        /// Declared parameter count
        expected: usize,
        /// Addresses supplied by the call-back stub
        given: usize,
    },

    /// Builtin argument failed to decode into its declared parameter type
    #[error("builtin `{name}` argument {index}: {reason}")]
    BuiltinArgumentDecode {
        /// Builtin name
        name: String,
        /// Zero-based argument position
        index: usize,
        /// Decode failure detail
        reason: String,
    },

    /// Builtin handler reported a failure
    #[error("builtin `{name}` failed: {reason}")]
    BuiltinExecution {
        /// Builtin name
        name: String,
        /// Handler failure detail
        reason: String,
    },

    /// Module aborted the in-progress evaluation
    #[error("policy module aborted: {0}")]
    SandboxTrap(String),

    /// Builtins or entrypoints metadata export was undecodable
    #[error("invalid module metadata: {0}")]
    InvalidMetadata(String),

    /// Linear memory access failed
    #[error("memory error: {0}")]
    Memory(String),

    /// Engine-level failure (instantiation, missing export, trap without a cause)
    #[error("WASM error: {0}")]
    Wasm(String),
}

/// Result type alias for policy sandbox operations
pub type Result<T> = std::result::Result<T, OpaError>;
