//! Built-in item functions for JSON items.
//!
//! The CLI cannot run user closures, so output arrays in the config file
//! name one of these functions. Every function takes an optional `field`
//! kwarg (a dotted path such as `meta.tokens` or `scores.0`) selecting the
//! part of the item it works on.

use crate::models::{
    AstackError, Config, ConfigError, FunctionConfig, FunctionError, FunctionSpec, Kwargs, Result as AstackResult,
    Value,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// A ready-to-call function over JSON items.
pub type JsonFn = Box<dyn Fn(&serde_json::Value, &Kwargs) -> Result<Value, FunctionError>>;

/// Builds a function from its kwargs, validating them up front.
pub type Builder = fn(&Kwargs) -> Result<JsonFn, BuiltinError>;

/// Errors raised by built-in functions, either when built or when called.
#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("expected {expected}, found {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing kwarg '{0}'")]
    MissingKwarg(&'static str),

    #[error("invalid kwarg '{name}': {reason}")]
    InvalidKwarg { name: &'static str, reason: String },

    #[error("cannot take the mean of an empty array")]
    EmptyArray,
}

/// Registry of named function builders.
pub struct FunctionRegistry {
    builders: BTreeMap<&'static str, Builder>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Registry with every built-in function.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("identity", build_identity);
        registry.register("field", build_field);
        registry.register("len", build_len);
        registry.register("sum", build_sum);
        registry.register("mean", build_mean);
        registry.register("scale", build_scale);
        registry.register("matches", build_matches);
        registry
    }

    /// Registry with no functions.
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Add or replace a function.
    pub fn register(&mut self, name: &'static str, builder: Builder) {
        self.builders.insert(name, builder);
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }

    /// Build the function spec for one config entry.
    pub fn spec(&self, config: &FunctionConfig) -> Result<FunctionSpec<serde_json::Value>, ConfigError> {
        let builder = self
            .builders
            .get(config.function.as_str())
            .ok_or_else(|| ConfigError::UnknownFunction {
                output: config.name.clone(),
                function: config.function.clone(),
            })?;

        let func = builder(&config.kwargs).map_err(|e| ConfigError::InvalidFunction {
            output: config.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(FunctionSpec::new(config.name.clone(), config.dtype, func)
            .with_shape(config.shape.clone())
            .with_kwargs(config.kwargs.clone()))
    }

    /// Build the function specs for every config entry, in order.
    pub fn specs(&self, config: &Config) -> Result<Vec<FunctionSpec<serde_json::Value>>, ConfigError> {
        config.validate()?;
        config.functions.iter().map(|f| self.spec(f)).collect()
    }
}

/// Load JSON items from a JSONL file, skipping blank lines.
pub fn load_items(path: &Path) -> AstackResult<Vec<serde_json::Value>> {
    let file = File::open(path).map_err(|e| AstackError::io("opening items file", e))?;
    let reader = BufReader::new(file);
    let mut items = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| AstackError::io("reading items file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let item: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| AstackError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
        items.push(item);
    }

    info!(count = items.len(), "Loaded items");
    Ok(items)
}

fn json_fn<F>(f: F) -> JsonFn
where
    F: Fn(&serde_json::Value, &Kwargs) -> Result<Value, FunctionError> + 'static,
{
    Box::new(f)
}

fn kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Follow a dotted path through objects (by key) and arrays (by index).
pub fn lookup<'a>(item: &'a serde_json::Value, path: &str) -> Result<&'a serde_json::Value, BuiltinError> {
    path.split('.').try_fold(item, |current, part| {
        let next = match current {
            serde_json::Value::Object(map) => map.get(part),
            serde_json::Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        next.ok_or_else(|| BuiltinError::MissingField(path.to_string()))
    })
}

fn field_kwarg(kwargs: &Kwargs) -> Result<Option<&str>, BuiltinError> {
    match kwargs.get("field") {
        None => Ok(None),
        Some(serde_json::Value::String(path)) => Ok(Some(path.as_str())),
        Some(other) => Err(BuiltinError::InvalidKwarg {
            name: "field",
            reason: format!("expected string, found {}", kind(other)),
        }),
    }
}

/// The part of `item` selected by the optional `field` kwarg.
fn target<'a>(item: &'a serde_json::Value, kwargs: &Kwargs) -> Result<&'a serde_json::Value, BuiltinError> {
    match field_kwarg(kwargs)? {
        Some(path) => lookup(item, path),
        None => Ok(item),
    }
}

fn numbers(json: &serde_json::Value) -> Result<Vec<f64>, BuiltinError> {
    let serde_json::Value::Array(items) = json else {
        return Err(BuiltinError::WrongKind {
            expected: "array",
            found: kind(json),
        });
    };
    items
        .iter()
        .map(|v| {
            v.as_f64().ok_or(BuiltinError::WrongKind {
                expected: "number",
                found: kind(v),
            })
        })
        .collect()
}

fn build_identity(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    Ok(json_fn(|item, kwargs| {
        Ok(Value::from_json(target(item, kwargs)?)?)
    }))
}

fn build_field(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    if field_kwarg(kwargs)?.is_none() {
        return Err(BuiltinError::MissingKwarg("field"));
    }
    build_identity(kwargs)
}

fn build_len(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    Ok(json_fn(|item, kwargs| {
        let len = match target(item, kwargs)? {
            serde_json::Value::String(s) => s.chars().count(),
            serde_json::Value::Array(items) => items.len(),
            serde_json::Value::Object(map) => map.len(),
            other => {
                return Err(BuiltinError::WrongKind {
                    expected: "string, array or object",
                    found: kind(other),
                }
                .into());
            }
        };
        Ok(Value::from(len))
    }))
}

fn build_sum(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    Ok(json_fn(|item, kwargs| {
        let values = numbers(target(item, kwargs)?)?;
        Ok(Value::Float(values.iter().sum()))
    }))
}

fn build_mean(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    Ok(json_fn(|item, kwargs| {
        let values = numbers(target(item, kwargs)?)?;
        if values.is_empty() {
            return Err(BuiltinError::EmptyArray.into());
        }
        Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
    }))
}

fn build_scale(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    let factor = match kwargs.get("factor") {
        None => return Err(BuiltinError::MissingKwarg("factor")),
        Some(v) => v.as_f64().ok_or_else(|| BuiltinError::InvalidKwarg {
            name: "factor",
            reason: format!("expected number, found {}", kind(v)),
        })?,
    };
    Ok(json_fn(move |item, kwargs| {
        let json = target(item, kwargs)?;
        let x = json.as_f64().ok_or(BuiltinError::WrongKind {
            expected: "number",
            found: kind(json),
        })?;
        Ok(Value::Float(x * factor))
    }))
}

fn build_matches(kwargs: &Kwargs) -> Result<JsonFn, BuiltinError> {
    field_kwarg(kwargs)?;
    let pattern = match kwargs.get("pattern") {
        None => return Err(BuiltinError::MissingKwarg("pattern")),
        Some(serde_json::Value::String(p)) => p,
        Some(other) => {
            return Err(BuiltinError::InvalidKwarg {
                name: "pattern",
                reason: format!("expected string, found {}", kind(other)),
            });
        }
    };
    let re = Regex::new(pattern).map_err(|e| BuiltinError::InvalidKwarg {
        name: "pattern",
        reason: e.to_string(),
    })?;
    Ok(json_fn(move |item, kwargs| {
        let json = target(item, kwargs)?;
        let text = json.as_str().ok_or(BuiltinError::WrongKind {
            expected: "string",
            found: kind(json),
        })?;
        Ok(Value::from(re.find_iter(text).count()))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DType;
    use serde_json::json;

    fn call(function: &str, kwargs: serde_json::Value, item: serde_json::Value) -> Result<Value, FunctionError> {
        let config = FunctionConfig {
            name: "out".to_string(),
            function: function.to_string(),
            dtype: DType::Float64,
            shape: vec![],
            kwargs: serde_json::from_value(kwargs).unwrap(),
        };
        let spec = FunctionRegistry::new().spec(&config).unwrap();
        spec.call(&item)
    }

    #[test]
    fn test_lookup_dotted_path() {
        let item = json!({"meta": {"scores": [1, 2, {"x": "deep"}]}});
        assert_eq!(lookup(&item, "meta.scores.2.x").unwrap(), &json!("deep"));
        assert!(matches!(
            lookup(&item, "meta.missing"),
            Err(BuiltinError::MissingField(p)) if p == "meta.missing"
        ));
        assert!(lookup(&item, "meta.scores.9").is_err());
    }

    #[test]
    fn test_len_sum_mean() {
        let item = json!({"text": "héllo", "xs": [1, 2.5, 3.5]});
        assert_eq!(call("len", json!({"field": "text"}), item.clone()).unwrap(), Value::UInt(5));
        assert_eq!(call("len", json!({"field": "xs"}), item.clone()).unwrap(), Value::UInt(3));
        assert_eq!(call("sum", json!({"field": "xs"}), item.clone()).unwrap(), Value::Float(7.0));
        assert_eq!(call("mean", json!({"field": "xs"}), item).unwrap(), Value::Float(7.0 / 3.0));
        assert!(call("mean", json!({}), json!([])).is_err());
        assert!(call("sum", json!({}), json!([1, "2"])).is_err());
    }

    #[test]
    fn test_scale_and_matches() {
        assert_eq!(
            call("scale", json!({"factor": 0.5}), json!(9)).unwrap(),
            Value::Float(4.5)
        );
        assert_eq!(
            call("matches", json!({"pattern": r"\d+", "field": "s"}), json!({"s": "a1 b22 c"})).unwrap(),
            Value::UInt(2)
        );
        assert!(call("scale", json!({"factor": 2}), json!("nine")).is_err());
    }

    #[test]
    fn test_identity_and_field() {
        assert_eq!(
            call("identity", json!({}), json!([1, 2])).unwrap(),
            Value::from(vec![1, 2])
        );
        assert_eq!(
            call("field", json!({"field": "a"}), json!({"a": "x"})).unwrap(),
            Value::from("x")
        );
        let err = call("field", json!({"field": "b"}), json!({"a": "x"})).unwrap_err();
        assert_eq!(err.to_string(), "missing field 'b'");
    }

    #[test]
    fn test_build_errors_are_config_errors() {
        let registry = FunctionRegistry::new();
        let mut config = FunctionConfig {
            name: "out".to_string(),
            function: "nope".to_string(),
            dtype: DType::UInt32,
            shape: vec![],
            kwargs: Kwargs::new(),
        };
        assert!(matches!(registry.spec(&config), Err(ConfigError::UnknownFunction { .. })));

        config.function = "scale".to_string();
        assert!(matches!(registry.spec(&config), Err(ConfigError::InvalidFunction { .. })));

        config.function = "matches".to_string();
        config.kwargs.insert("pattern".to_string(), json!("("));
        assert!(matches!(registry.spec(&config), Err(ConfigError::InvalidFunction { .. })));

        config.function = "field".to_string();
        config.kwargs.clear();
        assert!(matches!(registry.spec(&config), Err(ConfigError::InvalidFunction { .. })));
    }

    #[test]
    fn test_load_items_skips_blank_lines() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("items.jsonl");
        std::fs::write(&path, "{\"a\": 1}\n\n[1, 2]\n  \n\"x\"\n").unwrap();
        let items = load_items(&path).unwrap();
        assert_eq!(items, vec![json!({"a": 1}), json!([1, 2]), json!("x")]);

        std::fs::write(&path, "{\"a\": 1}\n{oops\n").unwrap();
        let err = load_items(&path).unwrap_err();
        assert!(matches!(err, AstackError::ParseError(msg) if msg.starts_with("Line 2")));
    }

    #[test]
    fn test_registry_names() {
        let names = FunctionRegistry::new().names();
        assert_eq!(
            names,
            vec!["field", "identity", "len", "matches", "mean", "scale", "sum"]
        );
    }
}
