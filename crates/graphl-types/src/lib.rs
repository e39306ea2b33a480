//! Shared types for the graphl host bridge.
//!
//! This crate defines the type model used to lay out values that cross the
//! host/guest boundary, and the schema of the metadata document a compiled
//! program embeds to describe its exports and required host functions.

pub mod abi;
pub mod meta;
pub mod ty;

pub use abi::{dispatch_key, dispatch_key_from_names};
pub use meta::{
    FieldDecl, FunctionMeta, HostFunctionMeta, HostMeta, Metadata, StructDecl, METADATA_MARKER,
};
pub use ty::{
    return_type, tuple_name, vec3, AbiType, ArraySlot, Primitive, StructField, StructType, Type,
    TypeError, TypeTable,
};

/// Size in bytes of the shared transfer window.
pub const TRANSFER_BUFFER_SIZE: u32 = 4096;

/// Exported i32 global holding the transfer window's base offset.
pub const TRANSFER_BUFFER_EXPORT: &str = "__graphl_transfer_buffer";
