//! Regex builtins.

use regex::Regex;
use serde_json::Value;

fn compile(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid pattern `{}`: {}", pattern, e))
}

/// `regex.split(pattern, s)`: split `s` on every match of `pattern`.
pub(crate) fn split_builtin(args: &[Value]) -> Result<Value, String> {
    let pattern = args[0].as_str().ok_or("pattern must be a string")?;
    let s = args[1].as_str().ok_or("value must be a string")?;

    let re = compile(pattern)?;
    let parts: Vec<Value> = re.split(s).map(|p| Value::String(p.to_string())).collect();
    Ok(Value::Array(parts))
}

/// `regex.find_n(pattern, s, n)`: the first `n` matches of `pattern` in `s`,
/// or all matches when `n` is -1.
pub(crate) fn find_n_builtin(args: &[Value]) -> Result<Value, String> {
    let pattern = args[0].as_str().ok_or("pattern must be a string")?;
    let s = args[1].as_str().ok_or("value must be a string")?;
    let n = args[2].as_i64().ok_or("count must be an integer")?;

    let re = compile(pattern)?;
    let matches = re.find_iter(s).map(|m| Value::String(m.as_str().to_string()));
    let found: Vec<Value> = if n >= 0 {
        matches.take(n as usize).collect()
    } else {
        matches.collect()
    };
    Ok(Value::Array(found))
}
