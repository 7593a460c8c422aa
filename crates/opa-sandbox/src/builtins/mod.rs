//! Host-side builtin functions and their registry.
//!
//! A compiled policy calls out to the host for every function it cannot
//! compute itself. Each builtin is declared up front as a [`Builtin`]
//! descriptor (name, ordered parameter types, return type, handler) and
//! collected into a [`BuiltinRegistry`]. The registry is assembled before
//! any policy is instantiated and never mutated afterwards; there is no
//! runtime discovery.
//!
//! Arguments and results are plain [`serde_json::Value`]s: the dispatch
//! layer in [`crate::wasm`] decodes each argument out of sandbox memory,
//! type-checks it against the descriptor, and encodes the handler's result
//! back in.

mod regex;
mod strings;

pub use strings::sprintf;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{OpaError, Result};

/// Declared type of a builtin parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Any JSON value
    Any,
    /// JSON null
    Null,
    /// JSON boolean
    Boolean,
    /// Any JSON number
    Number,
    /// JSON number with no fractional part
    Integer,
    /// JSON string
    String,
    /// JSON array
    Array,
    /// JSON object
    Object,
}

impl ParamType {
    /// Whether `value` satisfies this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::Null => value.is_null(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::String => value.is_string(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    /// Human-readable name used in decode errors.
    pub fn name(&self) -> &'static str {
        match self {
            ParamType::Any => "any",
            ParamType::Null => "null",
            ParamType::Boolean => "boolean",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::String => "string",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// Handler body: ordered decoded arguments in, one result out.
pub type BuiltinHandler = fn(&[Value]) -> std::result::Result<Value, String>;

/// A builtin descriptor: everything the dispatch path needs to know.
#[derive(Clone)]
pub struct Builtin {
    name: String,
    params: Vec<ParamType>,
    ret: ParamType,
    handler: BuiltinHandler,
}

impl Builtin {
    /// Declare a builtin.
    pub fn new(
        name: impl Into<String>,
        params: Vec<ParamType>,
        ret: ParamType,
        handler: BuiltinHandler,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            handler,
        }
    }

    /// Builtin name as the policy compiler knows it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered parameter type declarations.
    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    /// Declared result type.
    pub fn return_type(&self) -> ParamType {
        self.ret
    }

    /// Run the handler over already-decoded arguments.
    ///
    /// Callers are expected to have type-checked `args` against
    /// [`Self::params`]; the declared return type is enforced here.
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        let out = (self.handler)(args).map_err(|reason| OpaError::BuiltinExecution {
            name: self.name.clone(),
            reason,
        })?;
        if !self.ret.matches(&out) {
            return Err(OpaError::BuiltinExecution {
                name: self.name.clone(),
                reason: format!("handler returned non-{} result", self.ret.name()),
            });
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .finish()
    }
}

/// Name -> descriptor mapping, append-only while being built and read-only
/// once a policy uses it.
#[derive(Debug, Default)]
pub struct BuiltinRegistry {
    map: HashMap<String, Builtin>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<BuiltinRegistry>> = OnceLock::new();

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the default catalog.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for builtin in default_catalog() {
            reg.register(builtin);
        }
        reg
    }

    /// Add a builtin. Re-registering a name replaces the earlier entry.
    pub fn register(&mut self, builtin: Builtin) {
        self.map.insert(builtin.name.clone(), builtin);
    }

    /// Look up a builtin by name.
    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.map.get(name)
    }

    /// Number of registered builtins.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Seal `self` as the process-wide default registry.
    ///
    /// Must run before the first policy that relies on the default registry
    /// is constructed; fails once any default has been materialized.
    pub fn install(self) -> Result<()> {
        GLOBAL_REGISTRY
            .set(Arc::new(self))
            .map_err(|_| OpaError::Wasm("default builtin registry already initialized".into()))
    }

    /// The process-wide default registry, materialized from
    /// [`BuiltinRegistry::with_defaults`] on first use.
    pub fn global() -> Arc<BuiltinRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(Self::with_defaults()))
            .clone()
    }
}

/// The statically-declared catalog behind the default registry.
fn default_catalog() -> Vec<Builtin> {
    vec![
        Builtin::new(
            "sprintf",
            vec![ParamType::String, ParamType::Array],
            ParamType::String,
            strings::sprintf_builtin,
        ),
        Builtin::new(
            "regex.split",
            vec![ParamType::String, ParamType::String],
            ParamType::Array,
            regex::split_builtin,
        ),
        Builtin::new(
            "regex.find_n",
            vec![ParamType::String, ParamType::String, ParamType::Integer],
            ParamType::Array,
            regex::find_n_builtin,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_catalog_is_registered() {
        let reg = BuiltinRegistry::with_defaults();
        assert!(reg.get("sprintf").is_some());
        assert!(reg.get("regex.split").is_some());
        assert!(reg.get("regex.find_n").is_some());
        assert!(reg.get("http.send").is_none());
    }

    #[test]
    fn descriptor_shape() {
        let reg = BuiltinRegistry::with_defaults();
        let sprintf = reg.get("sprintf").unwrap();
        assert_eq!(sprintf.name(), "sprintf");
        assert_eq!(sprintf.params(), &[ParamType::String, ParamType::Array]);
        assert_eq!(sprintf.return_type(), ParamType::String);
    }

    #[test]
    fn param_type_matching() {
        assert!(ParamType::Any.matches(&json!(null)));
        assert!(ParamType::String.matches(&json!("x")));
        assert!(!ParamType::String.matches(&json!(1)));
        assert!(ParamType::Integer.matches(&json!(42)));
        assert!(!ParamType::Integer.matches(&json!(4.2)));
        assert!(ParamType::Number.matches(&json!(4.2)));
        assert!(ParamType::Array.matches(&json!([1, 2])));
        assert!(ParamType::Object.matches(&json!({"a": 1})));
    }

    #[test]
    fn invoke_enforces_return_type() {
        fn bad(_: &[Value]) -> std::result::Result<Value, String> {
            Ok(json!(1))
        }
        let b = Builtin::new("test.bad", vec![], ParamType::String, bad);
        assert!(matches!(
            b.invoke(&[]),
            Err(crate::OpaError::BuiltinExecution { .. })
        ));
    }

    #[test]
    fn register_replaces_existing_name() {
        fn one(_: &[Value]) -> std::result::Result<Value, String> {
            Ok(json!(1))
        }
        fn two(_: &[Value]) -> std::result::Result<Value, String> {
            Ok(json!(2))
        }
        let mut reg = BuiltinRegistry::new();
        reg.register(Builtin::new("test.n", vec![], ParamType::Integer, one));
        reg.register(Builtin::new("test.n", vec![], ParamType::Integer, two));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("test.n").unwrap().invoke(&[]).unwrap(), json!(2));
    }
}
