//! Parameter schema declared by a unit, and binding of caller input to it.
//!
//! The wire form (emitted by a unit in introspection mode) is a single JSON
//! object mapping parameter name to
//! `{flag, type, required, help?, default?, choices?}`. Parsing turns it into
//! a [`ParameterSchema`] with a tagged [`ParamKind`] per parameter; binding
//! validates caller values against it and renders the argument vector.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::runtime::INTROSPECTION_FLAG;

/// Value kind of a single parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    #[default]
    #[serde(rename = "str", alias = "string")]
    String,
    #[serde(rename = "int", alias = "integer")]
    Int,
    #[serde(rename = "float", alias = "number")]
    Float,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "choice")]
    Choice,
}

/// Declaration of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Command-line token the value is bound to (`--name`).
    #[serde(default)]
    pub flag: String,
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
}

/// Ordered mapping from parameter name to its declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema(IndexMap<String, ParamSpec>);

/// Reasons an introspection payload is rejected.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("expected exactly one line of schema output, got {0}")]
    LineCount(usize),

    #[error("schema is not a JSON object of parameter declarations: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid declaration for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

/// A caller value rejected by the schema. Never reaches a subprocess.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parameter '{parameter}': {message}")]
pub struct ValidationError {
    pub parameter: String,
    pub message: String,
}

impl ValidationError {
    fn new(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }
}

impl ParameterSchema {
    /// Parse the primary-output text of an introspection call.
    ///
    /// Exactly one line is accepted, optionally followed by a single newline.
    /// Blank lines count.
    pub fn parse(output: &str) -> Result<Self, SchemaError> {
        let body = output
            .strip_suffix('\n')
            .map(|b| b.strip_suffix('\r').unwrap_or(b))
            .unwrap_or(output);
        let lines: Vec<&str> = if body.is_empty() {
            Vec::new()
        } else {
            body.split('\n').collect()
        };
        if lines.len() != 1 {
            return Err(SchemaError::LineCount(lines.len()));
        }

        let mut params: IndexMap<String, ParamSpec> = serde_json::from_str(lines[0].trim())?;
        let mut seen_flags = std::collections::HashSet::new();

        for (name, spec) in params.iter_mut() {
            let invalid = |reason: &str| SchemaError::InvalidParameter {
                name: name.clone(),
                reason: reason.to_string(),
            };

            if name.trim().is_empty() {
                return Err(invalid("name must not be empty"));
            }
            if spec.flag.trim().is_empty() {
                spec.flag = format!("--{name}");
            }
            if !spec.flag.starts_with('-') {
                return Err(invalid("flag must start with '-'"));
            }
            if spec.flag == INTROSPECTION_FLAG {
                return Err(invalid("flag collides with the introspection flag"));
            }
            if !seen_flags.insert(spec.flag.clone()) {
                return Err(invalid("flag is declared more than once"));
            }
            if spec.kind == ParamKind::Choice && spec.choices.is_empty() {
                return Err(invalid("choice parameter needs a non-empty choices list"));
            }
        }

        Ok(Self(params))
    }

    /// Canonical single-line JSON form (stable for an unchanged schema).
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamSpec)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate caller values and render the argument vector in schema order.
    ///
    /// Boolean parameters become presence-only flags; everything else is a
    /// `flag value` pair. Absent optional parameters are omitted so the unit
    /// applies its own default. Names not in the schema are ignored.
    pub fn bind(&self, params: &serde_json::Map<String, Value>) -> Result<Vec<String>, ValidationError> {
        let mut args = Vec::new();

        for (name, spec) in &self.0 {
            let value = match params.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::new(name, "required parameter is missing"));
                    }
                    continue;
                }
                Some(v) => v,
            };

            if spec.kind == ParamKind::Bool {
                if coerce_bool(name, value)? {
                    args.push(spec.flag.clone());
                }
                continue;
            }

            let rendered = coerce(name, spec, value)?;
            args.push(spec.flag.clone());
            args.push(rendered);
        }

        Ok(args)
    }
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce(name: &str, spec: &ParamSpec, value: &Value) -> Result<String, ValidationError> {
    match spec.kind {
        ParamKind::String => scalar_text(value)
            .ok_or_else(|| ValidationError::new(name, "expected a string")),
        ParamKind::File => match value.as_str() {
            Some(path) if !path.trim().is_empty() => Ok(path.to_string()),
            _ => Err(ValidationError::new(name, "expected a non-empty file path")),
        },
        ParamKind::Int => coerce_int(value)
            .map(|i| i.to_string())
            .ok_or_else(|| ValidationError::new(name, "expected an integer")),
        ParamKind::Float => coerce_float(value)
            .map(|f| f.to_string())
            .ok_or_else(|| ValidationError::new(name, "expected a number")),
        ParamKind::Url => match value.as_str().map(str::trim) {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Ok(url.to_string())
            }
            _ => Err(ValidationError::new(
                name,
                "expected a URL starting with http:// or https://",
            )),
        },
        ParamKind::Json => match value {
            Value::String(text) => serde_json::from_str::<Value>(text)
                .map(|parsed| parsed.to_string())
                .map_err(|e| ValidationError::new(name, format!("invalid JSON: {e}"))),
            other => Ok(other.to_string()),
        },
        ParamKind::Choice => {
            let text = scalar_text(value)
                .ok_or_else(|| ValidationError::new(name, "expected one of the allowed choices"))?;
            if spec
                .choices
                .iter()
                .filter_map(scalar_text)
                .any(|choice| choice == text)
            {
                Ok(text)
            } else {
                let allowed: Vec<String> = spec.choices.iter().filter_map(scalar_text).collect();
                Err(ValidationError::new(
                    name,
                    format!("'{text}' is not one of [{}]", allowed.join(", ")),
                ))
            }
        }
        ParamKind::Bool => coerce_bool(name, value).map(|b| b.to_string()),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn coerce_bool(name: &str, value: &Value) -> Result<bool, ValidationError> {
    let parsed = match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::new(name, "expected a boolean"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
