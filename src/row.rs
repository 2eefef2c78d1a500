use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// A single field value read from the warehouse.
///
/// The warehouse schema for reconstruction sources is deliberately narrow:
/// integer-typed facts (ids, counts, epoch timestamps) and strings (names,
/// dates rendered as text). Anything wider is cast in the source query.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Null,
}

impl Value {
    /// Returns the value's type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Null => "null",
        }
    }

    /// True if this value is the zero marker used by the synthetic
    /// terminator row (integer 0, or its string rendering).
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(v) => *v == 0,
            Value::Str(s) => s.is_empty() || s == "0",
            Value::Null => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Null => f.write_str("NULL"),
        }
    }
}

/// Error raised when a row does not satisfy a state machine's field
/// contract. This is a precondition violation: the source query and its
/// ordering guarantee the row shape, so a failure here means the upstream
/// contract was not honored, and the stage must abort.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("missing required field `{0}`")]
    Missing(String),

    #[error("field `{field}` is {actual}, expected {expected}")]
    Type {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("field `{field}` holds unparsable value `{value}`")]
    Invalid { field: String, value: String },
}

/// A field-name-keyed row from the ordered source stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Builder-style [`set`](Self::set), used heavily by test fixtures.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Fetches a required integer field.
    pub fn int(&self, name: &str) -> Result<i64, FieldError> {
        match self.fields.get(name) {
            Some(Value::Int(v)) => Ok(*v),
            Some(other) => Err(FieldError::Type {
                field: name.to_string(),
                expected: "integer",
                actual: other.type_name(),
            }),
            None => Err(FieldError::Missing(name.to_string())),
        }
    }

    /// Fetches a required string field.
    pub fn text(&self, name: &str) -> Result<&str, FieldError> {
        match self.fields.get(name) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(FieldError::Type {
                field: name.to_string(),
                expected: "string",
                actual: other.type_name(),
            }),
            None => Err(FieldError::Missing(name.to_string())),
        }
    }

    /// Fetches a required field of any type.
    pub fn require(&self, name: &str) -> Result<&Value, FieldError> {
        self.fields
            .get(name)
            .ok_or_else(|| FieldError::Missing(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True if every field holds the zero marker. The source query appends
    /// exactly one such row (the UNION ALL terminator); the source layer
    /// converts it to [`StreamItem::EndOfStream`] before the state machines
    /// ever see it.
    pub fn is_sentinel(&self) -> bool {
        !self.fields.is_empty() && self.fields.values().all(Value::is_zero)
    }

    /// Compact `field=value` rendering for error context, fields sorted by
    /// name so messages are stable.
    pub fn summary(&self) -> String {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        let mut out = String::new();
        for (idx, name) in names.into_iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            out.push_str(name);
            out.push('=');
            out.push_str(&self.fields[name].to_string());
        }
        out
    }
}

/// One element of the ordered source stream.
///
/// The physical stream terminates with a synthetic all-zero row so that the
/// single-pass state machines flush their last open interval. That magic row
/// never crosses this boundary: the source maps it (or plain stream
/// exhaustion) to `EndOfStream`, so the machines match on an explicit
/// variant rather than sniffing zero values.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Row(Row),
    EndOfStream,
}
