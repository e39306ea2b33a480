//! Names of the entry points that make up the host/guest calling contract.
//!
//! ## Guest exports
//! - `memory`: linear memory
//! - `__graphl_transfer_buffer`: immutable i32 global, transfer window base
//! - `create_array(len) → handle`
//! - `commit_array_page(handle, offset)`
//! - `copy_array_page(handle, offset) → bytes_written`
//! - per struct `T`:
//!   - `materialize_struct_T_fields() → handle`
//!   - `commit_struct_T_array(handle, slot, offset, len)`
//!   - `extract_struct_T_fields(handle) → array_slot_count`
//!   - `extract_struct_T_array(handle, slot, offset) → bytes_written`
//! - (optional) `set_init_opts(len) → ok`
//!
//! ## Guest imports
//! - `env.<dispatch key>(func_id, args...) → result`, one per distinct host
//!   function signature (see [`dispatch_key`]).

use crate::ty::Type;

/// Module name under which host trampolines are imported.
pub const HOST_MODULE: &str = "env";

pub const MEMORY_EXPORT: &str = "memory";
pub const CREATE_ARRAY: &str = "create_array";
pub const COMMIT_ARRAY_PAGE: &str = "commit_array_page";
pub const COPY_ARRAY_PAGE: &str = "copy_array_page";
pub const SET_INIT_OPTS: &str = "set_init_opts";

pub fn materialize_struct_fields(struct_name: &str) -> String {
    format!("materialize_struct_{struct_name}_fields")
}

pub fn commit_struct_array(struct_name: &str) -> String {
    format!("commit_struct_{struct_name}_array")
}

pub fn extract_struct_fields(struct_name: &str) -> String {
    format!("extract_struct_{struct_name}_fields")
}

pub fn extract_struct_array(struct_name: &str) -> String {
    format!("extract_struct_{struct_name}_array")
}

/// Derive the import name shared by every host function with this signature.
///
/// `callUserFunc`, each input type name, `R`, each output type name, joined
/// by underscores: `[i32, i32] -> [i32]` is `callUserFunc_i32_i32_R_i32`.
pub fn dispatch_key(inputs: &[Type], outputs: &[Type]) -> String {
    join_dispatch_key(inputs.iter().map(Type::name), outputs.iter().map(Type::name))
}

/// [`dispatch_key`] over unresolved type names, as a host function declares them.
pub fn dispatch_key_from_names<S: AsRef<str>>(inputs: &[S], outputs: &[S]) -> String {
    join_dispatch_key(
        inputs.iter().map(AsRef::as_ref),
        outputs.iter().map(AsRef::as_ref),
    )
}

fn join_dispatch_key<'a>(
    inputs: impl Iterator<Item = &'a str>,
    outputs: impl Iterator<Item = &'a str>,
) -> String {
    let mut parts = vec!["callUserFunc"];
    parts.extend(inputs);
    parts.push("R");
    parts.extend(outputs);
    parts.join("_")
}
