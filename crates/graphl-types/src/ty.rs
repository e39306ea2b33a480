//! Type model for values crossing the host/guest boundary.
//!
//! Every type is either a [`Primitive`] or a [`StructType`].  Struct layouts
//! are packed: a field's offset is the sum of the sizes of every field before
//! it, with no alignment padding.
//!
//! ```text
//! vec3 (size 24)
//! offset+0  : f64 x
//! offset+8  : f64 y
//! offset+16 : f64 z
//! ```
//!
//! `string` fields occupy a 4-byte slot inside a struct.  Their bytes never
//! travel inline; they are streamed separately through numbered array slots
//! (see [`StructType::array_slots`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::meta::{Metadata, StructDecl};

// ══════════════════════════════════════════════════════════════════════════════
// Primitives
// ══════════════════════════════════════════════════════════════════════════════

/// A singleton primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// UTF-8 text, heap-allocated on the guest side as a byte array.
    String,
}

impl Primitive {
    /// Every primitive, in the order they are registered in a [`TypeTable`].
    pub const ALL: [Primitive; 9] = [
        Primitive::Void,
        Primitive::Bool,
        Primitive::I32,
        Primitive::U32,
        Primitive::I64,
        Primitive::U64,
        Primitive::F32,
        Primitive::F64,
        Primitive::String,
    ];

    /// The name used in metadata documents and dispatch keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::String => "string",
        }
    }

    /// Size in bytes when laid out inside a struct.
    pub fn size(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bool | Self::I32 | Self::U32 | Self::F32 | Self::String => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Look up a primitive by its metadata name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// ABI value type of this primitive; `None` for `void`.
    pub fn abi(self) -> Option<AbiType> {
        match self {
            Self::Void => None,
            Self::Bool | Self::I32 | Self::U32 | Self::String => Some(AbiType::I32),
            Self::I64 | Self::U64 => Some(AbiType::I64),
            Self::F32 => Some(AbiType::F32),
            Self::F64 => Some(AbiType::F64),
        }
    }
}

/// A wasm value type as seen on the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    I32,
    I64,
    F32,
    F64,
}

// ══════════════════════════════════════════════════════════════════════════════
// Type
// ══════════════════════════════════════════════════════════════════════════════

/// A type description, matched structurally.
///
/// Two separately constructed struct types with the same name and fields
/// compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Primitive(Primitive),
    Struct(Arc<StructType>),
}

impl Type {
    pub const VOID: Type = Type::Primitive(Primitive::Void);
    pub const BOOL: Type = Type::Primitive(Primitive::Bool);
    pub const I32: Type = Type::Primitive(Primitive::I32);
    pub const U32: Type = Type::Primitive(Primitive::U32);
    pub const I64: Type = Type::Primitive(Primitive::I64);
    pub const U64: Type = Type::Primitive(Primitive::U64);
    pub const F32: Type = Type::Primitive(Primitive::F32);
    pub const F64: Type = Type::Primitive(Primitive::F64);
    pub const STRING: Type = Type::Primitive(Primitive::String);

    /// Wrap a struct description.
    pub fn structure(st: StructType) -> Self {
        Type::Struct(Arc::new(st))
    }

    pub fn name(&self) -> &str {
        match self {
            Type::Primitive(p) => p.name(),
            Type::Struct(st) => st.name(),
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Type::Primitive(p) => p.size(),
            Type::Struct(st) => st.size(),
        }
    }

    /// ABI value type.  Structs travel as an opaque `i32` handle.
    pub fn abi(&self) -> Option<AbiType> {
        match self {
            Type::Primitive(p) => p.abi(),
            Type::Struct(_) => Some(AbiType::I32),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Primitive(Primitive::Void))
    }

    /// Whether values of this type are streamed as a byte array.
    pub fn is_array(&self) -> bool {
        matches!(self, Type::Primitive(Primitive::String))
    }

    pub fn as_primitive(&self) -> Option<Primitive> {
        match self {
            Type::Primitive(p) => Some(*p),
            Type::Struct(_) => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            Type::Struct(st) => Some(st),
            Type::Primitive(_) => None,
        }
    }
}

impl From<Primitive> for Type {
    fn from(p: Primitive) -> Self {
        Type::Primitive(p)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Structs
// ══════════════════════════════════════════════════════════════════════════════

/// A field inside a [`StructType`].
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
    /// Byte offset from the start of the enclosing struct.
    pub offset: u32,
}

/// A named struct with a packed field layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    name: String,
    size: u32,
    fields: Vec<StructField>,
}

/// A string field reachable from a struct, possibly through nested structs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySlot {
    /// Field names from the outermost struct down to the string field.
    pub path: Vec<String>,
    /// Absolute byte offset of the field's 4-byte slot.
    pub offset: u32,
}

impl ArraySlot {
    /// Dotted field path, e.g. `"origin.label"`.
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }
}

impl StructType {
    /// Build a struct, computing packed offsets from the field order.
    pub fn new<N, I>(name: impl Into<String>, fields: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Type)>,
    {
        let mut offset = 0u32;
        let fields = fields
            .into_iter()
            .map(|(field_name, ty)| {
                let field = StructField {
                    name: field_name.into(),
                    offset,
                    ty,
                };
                offset += field.ty.size();
                field
            })
            .collect();
        Self {
            name: name.into(),
            size: offset,
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total packed size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Byte offset of each field, in declaration order.
    pub fn offsets(&self) -> Vec<u32> {
        self.fields.iter().map(|f| f.offset).collect()
    }

    /// Every string field in depth-first declaration order.
    ///
    /// Slot `i` on the wire is entry `i` of this list.
    pub fn array_slots(&self) -> Vec<ArraySlot> {
        let mut slots = Vec::new();
        self.collect_slots(0, &mut Vec::new(), &mut slots);
        slots
    }

    fn collect_slots(&self, base: u32, path: &mut Vec<String>, out: &mut Vec<ArraySlot>) {
        for field in &self.fields {
            path.push(field.name.clone());
            match &field.ty {
                Type::Struct(nested) => nested.collect_slots(base + field.offset, path, out),
                ty if ty.is_array() => out.push(ArraySlot {
                    path: path.clone(),
                    offset: base + field.offset,
                }),
                _ => {}
            }
            path.pop();
        }
    }
}

/// Name of the anonymous struct synthesized for a multi-value result.
pub fn tuple_name(types: &[Type]) -> String {
    let mut name = String::from("tuple");
    for ty in types {
        name.push('_');
        name.push_str(ty.name());
    }
    name
}

/// The canonical type describing a function's outputs.
///
/// Zero outputs → `void`, one output → that type, several → an anonymous
/// struct whose fields are named `"0"`, `"1"`, ...
pub fn return_type(outputs: &[Type]) -> Type {
    match outputs {
        [] => Type::VOID,
        [single] => single.clone(),
        many => Type::structure(StructType::new(
            tuple_name(many),
            many.iter()
                .enumerate()
                .map(|(i, ty)| (i.to_string(), ty.clone())),
        )),
    }
}

/// The built-in `vec3 { x: f64, y: f64, z: f64 }` struct.
pub fn vec3() -> Type {
    Type::structure(StructType::new(
        "vec3",
        [("x", Type::F64), ("y", Type::F64), ("z", Type::F64)],
    ))
}

// ══════════════════════════════════════════════════════════════════════════════
// TypeTable
// ══════════════════════════════════════════════════════════════════════════════

/// Errors raised while resolving type names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("type `{0}` is already defined")]
    DuplicateType(String),

    #[error("field `{field}` of struct `{name}` cannot be void")]
    VoidField { name: String, field: String },
}

/// Name → type lookup used when interpreting a metadata document.
///
/// Pre-populated with every [`Primitive`] and `vec3`.
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: BTreeMap<String, Type>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        for p in Primitive::ALL {
            types.insert(p.name().to_string(), Type::Primitive(p));
        }
        types.insert("vec3".to_string(), vec3());
        Self { types }
    }

    /// Build a table containing the built-ins plus every struct the
    /// metadata declares.
    pub fn from_metadata(meta: &Metadata) -> Result<Self, TypeError> {
        let mut table = Self::new();
        for decl in &meta.structs {
            table.define_struct(decl)?;
        }
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name)
    }

    pub fn resolve(&self, name: &str) -> Result<Type, TypeError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| TypeError::UnknownType(name.to_string()))
    }

    pub fn resolve_all(&self, names: &[String]) -> Result<Vec<Type>, TypeError> {
        names.iter().map(|n| self.resolve(n)).collect()
    }

    /// Register a struct declaration.  Field types must already be known,
    /// so nested structs are declared before the structs that use them.
    pub fn define_struct(&mut self, decl: &StructDecl) -> Result<Type, TypeError> {
        if self.types.contains_key(&decl.name) {
            return Err(TypeError::DuplicateType(decl.name.clone()));
        }
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in &decl.fields {
            let ty = self.resolve(&field.ty)?;
            if ty.is_void() {
                return Err(TypeError::VoidField {
                    name: decl.name.clone(),
                    field: field.name.clone(),
                });
            }
            fields.push((field.name.clone(), ty));
        }
        let ty = Type::structure(StructType::new(decl.name.clone(), fields));
        self.types.insert(decl.name.clone(), ty.clone());
        Ok(ty)
    }

    /// Every struct type in the table, ordered by name.
    pub fn structs(&self) -> impl Iterator<Item = &StructType> {
        self.types.values().filter_map(Type::as_struct)
    }
}
