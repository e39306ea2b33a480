//! Host runtime for graphl programs.
//!
//! # Architecture
//!
//! A compiled graphl program is a wasm module that embeds a metadata
//! document describing its exported functions and the host functions it
//! needs.  [`Program::instantiate`] locates that document, wires the
//! embedder's [`HostEnv`] into the module's imports, and exposes every
//! export as a typed call taking and returning [`Value`]s.
//!
//! ## Value transfer
//!
//! Fixed-width values cross as plain wasm values.  Strings and structs live
//! in guest memory and are streamed through a 4096-byte window shared by
//! host and guest (see [`transfer`]), driven by guest entry points such as
//! `create_array` and `materialize_struct_<T>_fields`.
//!
//! ## Host functions
//!
//! Host functions sharing a signature share one import, named by the
//! signature's dispatch key (`callUserFunc_i32_i32_R_i32`).  The guest
//! passes the function's id as the first argument; see [`dispatch`].
//!
//! ```ignore
//! let env = HostEnv::new().with(
//!     "Add",
//!     HostFunctionDesc::new(|args| Ok(Value::Int(args[0].as_int().unwrap_or(0) + 1)))
//!         .input("a", "i32")
//!         .output("sum", "i32"),
//! );
//! let mut program = Program::instantiate(&wasm, &env, RuntimeConfig::default())?;
//! let result = program.call("main", &[Value::from(3)])?;
//! ```
//!
//! Calls into one program are strictly sequential; host functions must not
//! re-enter the program that called them.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metadata;
pub mod runtime;
pub mod transfer;
pub mod value;

pub use codec::{Prepared, ValueCodec};
pub use config::RuntimeConfig;
pub use dispatch::{HostEnv, HostFn, HostFunctionDesc, HostFunctionKind, Param};
pub use error::{BoxError, RuntimeError, RuntimeResult};
pub use runtime::{ExportedFunction, HostState, LoadStage, Program};
pub use transfer::TransferBuffer;
pub use value::{GuestHandle, StructValue, Value};

pub use graphl_types as types;
