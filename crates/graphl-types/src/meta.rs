//! Schema of the metadata document embedded in every compiled program.
//!
//! ```json
//! {
//!   "__graphl_metadata_7c2e9b4d": true,
//!   "functions": [{ "name": "main", "inputs": ["i32"], "outputs": ["string"] }],
//!   "host": { "functions": [{ "id": 0, "name": "Add", "inputs": ["i32", "i32"], "outputs": ["i32"] }] },
//!   "structs": [{ "name": "pin", "fields": [{ "name": "at", "type": "vec3" }] }]
//! }
//! ```
//!
//! The marker key lets a host locate the document inside raw binary bytes
//! without understanding the binary format.  It is stripped before the
//! document is deserialized.

use serde::{Deserialize, Serialize};

/// Unique key identifying the embedded metadata object.
pub const METADATA_MARKER: &str = "__graphl_metadata_7c2e9b4d";

/// The parsed metadata document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Functions exported by the compiled program.
    pub functions: Vec<FunctionMeta>,
    /// Host functions the program imports.
    pub host: HostMeta,
    /// Struct types beyond the built-ins, in dependency order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structs: Vec<StructDecl>,
}

/// An exported function signature, by type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMeta {
    pub functions: Vec<HostFunctionMeta>,
}

/// A host function required by the program, with the dense id the compiler
/// assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFunctionMeta {
    pub id: u32,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl Metadata {
    /// Look up an exported function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionMeta> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a required host function by name.
    pub fn host_function(&self, name: &str) -> Option<&HostFunctionMeta> {
        self.host.functions.iter().find(|f| f.name == name)
    }

    /// Serialize with the marker key, ready to embed in a binary.
    pub fn to_embedded_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(METADATA_MARKER.to_string(), serde_json::Value::Bool(true));
        }
        serde_json::to_vec(&value)
    }

    /// Deserialize a located document, dropping the marker key.
    pub fn from_embedded_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_slice(data)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove(METADATA_MARKER);
        }
        serde_json::from_value(value)
    }
}
