//! Linear-memory layout of an assembled guest module.
//!
//! ```text
//! 0      .. 1024   : reserved, zero (address 0 doubles as the empty array)
//! 1024   .. 5120   : transfer window (4096 bytes)
//! 5120   .. N      : embedded metadata document
//! align8(N) ..     : bump-allocated heap
//! ```
//!
//! # Array representation
//!
//! A string is an 8-byte header allocated on the heap; its address is the
//! handle passed across the boundary.
//!
//! | Offset | Field                 |
//! |--------|-----------------------|
//! | +0     | i32 data pointer      |
//! | +4     | i32 byte length       |
//!
//! # Struct representation
//!
//! A struct handle is the address of a block holding the packed field bytes
//! exactly as they appeared in the transfer window.  Each string field's
//! 4-byte slot holds an array handle.

use graphl_types::TRANSFER_BUFFER_SIZE;

/// Base offset of the transfer window.
pub const TRANSFER_BUFFER_OFFSET: u32 = 1024;

/// Offset of the embedded metadata document.
pub const METADATA_OFFSET: u32 = TRANSFER_BUFFER_OFFSET + TRANSFER_BUFFER_SIZE;

/// Size of an array header.
pub const ARRAY_HEADER_SIZE: u32 = 8;

/// Wasm page size in bytes.
pub const PAGE_SIZE: u32 = 65536;

// ── Memory ───────────────────────────────────────────────────────────────────

/// Initial linear memory size in pages (64 KiB each).
pub const INITIAL_MEMORY_PAGES: u64 = 1;
/// Maximum linear memory pages (16 MiB).
pub const MAX_MEMORY_PAGES: u64 = 256;

// ── Global variable indices ──────────────────────────────────────────────────
// (order must match the global section emission in builder.rs)

/// Heap allocation pointer: next free byte in linear memory.
pub const GLOBAL_HEAP_PTR: u32 = 0;
/// Transfer window base offset (immutable, exported).
pub const GLOBAL_TRANSFER_BUFFER: u32 = 1;
/// Array handle of the options blob received through `set_init_opts`.
pub const GLOBAL_INIT_OPTS: u32 = 2;

// ── Custom section ───────────────────────────────────────────────────────────

/// Custom section carrying the assembler version.
pub const CUSTOM_SECTION_NAME: &str = "graphl";
/// Assembler version embedded in the custom section.
pub const ASSEMBLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// First heap address for a module whose metadata is `metadata_len` bytes.
pub const fn heap_start(metadata_len: u32) -> u32 {
    (METADATA_OFFSET + metadata_len + 7) & !7
}
