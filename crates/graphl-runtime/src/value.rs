//! Host-side values exchanged with a guest program.

use std::fmt;

/// A dynamically typed host value.
///
/// Integers are carried as `i128` so values outside a declared field's range
/// (`-1` or `2^64` offered to a `u64`) reach the encoder intact and are
/// rejected there instead of wrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(String),
    Struct(StructValue),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers convert to floating point.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Short description used in type mismatch reports.
    pub(crate) fn describe(&self) -> String {
        match self {
            Value::Void => "void".to_string(),
            Value::Bool(b) => format!("bool {b}"),
            Value::Int(n) => format!("integer {n}"),
            Value::Float(f) => format!("float {f}"),
            Value::String(_) => "string".to_string(),
            Value::Struct(_) => "struct".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Struct(s) => {
                f.write_str("{")?;
                for (i, (name, value)) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Int(n as i128)
            }
        })*
    };
}

int_from!(i32, u32, i64, u64, i128);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<StructValue> for Value {
    fn from(s: StructValue) -> Self {
        Value::Struct(s)
    }
}

/// Back-reference from a decoded struct to the guest block it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestHandle {
    pub(crate) runtime_id: u64,
    pub(crate) type_name: String,
    pub(crate) raw: i32,
}

impl GuestHandle {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn raw(&self) -> i32 {
        self.raw
    }
}

/// A struct value: ordered named fields.
///
/// A struct decoded from a guest remembers its guest handle so passing it
/// back unchanged skips re-encoding.  Any mutation through [`Self::set`]
/// drops the handle.  Equality ignores the handle.
#[derive(Debug, Clone, Default)]
pub struct StructValue {
    fields: Vec<(String, Value)>,
    handle: Option<GuestHandle>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field append.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Set or append a field.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.handle = None;
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn handle(&self) -> Option<&GuestHandle> {
        self.handle.as_ref()
    }

    /// Mutable access to a field; drops the guest handle.
    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.handle = None;
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub(crate) fn attach_handle(&mut self, handle: GuestHandle) {
        self.handle = Some(handle);
    }
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for StructValue {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
            handle: None,
        }
    }
}
