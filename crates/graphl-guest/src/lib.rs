//! Guest module assembler for the graphl host bridge.
//!
//! # Architecture
//!
//! [`GuestBuilder`] emits a self-contained `.wasm` module implementing the
//! guest side of the graphl calling contract.  It stands in for the program
//! compiler when exercising the runtime: callers describe structs, required
//! host functions and exported functions (with hand-written bodies), and the
//! assembler supplies everything else.
//!
//! ## Imports
//! - `env.<dispatch key>(func_id, args...) → result`, one per distinct host
//!   function signature
//!
//! ## Exports
//! - `memory`, `__graphl_transfer_buffer`
//! - `create_array`, `commit_array_page`, `copy_array_page`, `set_init_opts`
//! - four streaming entry points per struct (built-ins, declared structs and
//!   tuple structs synthesized for multi-value results)
//! - every user function
//!
//! ## Embedded metadata
//!
//! The metadata document is placed in the data section right after the
//! transfer window.  See [`layout`] for the full memory map.

pub mod builder;
pub mod error;
pub mod layout;
pub mod runtime;

pub use builder::{BodyFn, GuestBuilder, HostRef, Symbols};
pub use error::{GuestError, GuestResult};
