//! Runtime helper functions emitted into the guest module.
//!
//! These implement the guest half of the streaming contract: array creation
//! and page-wise copying through the transfer window, plus the per-struct
//! materialize/extract entry points.  Every function is registered during
//! module assembly (in `builder.rs`) and referenced by its function index.

use graphl_types::{StructType, TRANSFER_BUFFER_SIZE};
use wasm_encoder::{BlockType, Function, Instruction, ValType};

use crate::layout::*;

// ══════════════════════════════════════════════════════════════════════════════
// Runtime function index offsets (relative to the import count)
// ══════════════════════════════════════════════════════════════════════════════

/// Bump-allocate `size` bytes, growing memory as needed; returns pointer.
///
/// `alloc(size: i32) -> i32`
pub const RT_ALLOC: u32 = 0;

/// `create_array(len: i32) -> i32`
pub const RT_CREATE_ARRAY: u32 = 1;

/// `commit_array_page(handle: i32, offset: i32)`
pub const RT_COMMIT_ARRAY_PAGE: u32 = 2;

/// `copy_array_page(handle: i32, offset: i32) -> i32`
pub const RT_COPY_ARRAY_PAGE: u32 = 3;

/// `set_init_opts(len: i32) -> i32`
pub const RT_SET_INIT_OPTS: u32 = 4;

/// Total number of runtime helper functions.
pub const RT_FUNC_COUNT: u32 = 5;

/// Number of helpers emitted per struct type.
pub const STRUCT_FUNC_COUNT: u32 = 4;

/// Absolute indices of the helpers other helpers call.
#[derive(Debug, Clone, Copy)]
pub struct HelperIndices {
    pub alloc: u32,
    pub create_array: u32,
    pub commit_array_page: u32,
    pub copy_array_page: u32,
}

impl HelperIndices {
    pub fn new(import_count: u32) -> Self {
        Self {
            alloc: import_count + RT_ALLOC,
            create_array: import_count + RT_CREATE_ARRAY,
            commit_array_page: import_count + RT_COMMIT_ARRAY_PAGE,
            copy_array_page: import_count + RT_COPY_ARRAY_PAGE,
        }
    }
}

pub(crate) fn memarg(offset: u64, align: u32) -> wasm_encoder::MemArg {
    wasm_encoder::MemArg {
        offset,
        align,
        memory_index: 0,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Array helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Emit `alloc(size: i32) -> i32`.
///
/// Returns the current heap pointer and advances it by `size` rounded up to
/// 8 bytes.  Grows memory when the new heap pointer passes the end; traps if
/// growth fails.
pub fn emit_alloc() -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 1: old_ptr
    // old_ptr = heap_ptr
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::LocalSet(1));
    // heap_ptr = (old_ptr + size + 7) & ~7
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(7));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(-8));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::GlobalSet(GLOBAL_HEAP_PTR));

    // if heap_ptr > memory.size * PAGE_SIZE → grow
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::MemorySize(0));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32Shl);
    f.instruction(&Instruction::I32GtU);
    f.instruction(&Instruction::If(BlockType::Empty));
    // pages = (heap_ptr - mem_bytes + PAGE_SIZE - 1) >> 16
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::MemorySize(0));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32Shl);
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::I32Const(PAGE_SIZE as i32 - 1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32ShrU);
    f.instruction(&Instruction::MemoryGrow(0));
    f.instruction(&Instruction::I32Const(-1));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);

    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

/// Emit `create_array(len: i32) -> i32`.
///
/// Allocates a header and a `len`-byte data block; returns the header.
pub fn emit_create_array(ix: HelperIndices) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 1: header
    // header = alloc(ARRAY_HEADER_SIZE)
    f.instruction(&Instruction::I32Const(ARRAY_HEADER_SIZE as i32));
    f.instruction(&Instruction::Call(ix.alloc));
    f.instruction(&Instruction::LocalSet(1));
    // header.len = len
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Store(memarg(4, 2)));
    // header.data = alloc(len)
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::Call(ix.alloc));
    f.instruction(&Instruction::I32Store(memarg(0, 2)));

    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

/// Emit `n = clamp(handle.len - offset, ..= TRANSFER_BUFFER_SIZE)` into local `n`.
fn emit_page_len(f: &mut Function, handle: u32, offset: u32, n: u32) {
    f.instruction(&Instruction::LocalGet(handle));
    f.instruction(&Instruction::I32Load(memarg(4, 2)));
    f.instruction(&Instruction::LocalGet(offset));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::LocalSet(n));
    // if n > TRANSFER_BUFFER_SIZE { n = TRANSFER_BUFFER_SIZE }
    f.instruction(&Instruction::LocalGet(n));
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_SIZE as i32));
    f.instruction(&Instruction::I32GtS);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_SIZE as i32));
    f.instruction(&Instruction::LocalSet(n));
    f.instruction(&Instruction::End);
}

/// Emit `commit_array_page(handle: i32, offset: i32)`.
///
/// Copies the next page (at most one window) from the transfer window into
/// the array at `offset`.
pub fn emit_commit_array_page() -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 2: n
    emit_page_len(&mut f, 0, 1, 2);
    // if n <= 0 → return
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::I32LeS);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    // memory.copy(handle.data + offset, TRANSFER_BUFFER, n)
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load(memarg(0, 2)));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_OFFSET as i32));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    f.instruction(&Instruction::End);
    f
}

/// Emit `copy_array_page(handle: i32, offset: i32) -> i32`.
///
/// Copies the next page of the array into the transfer window and returns
/// the byte count; zero once `offset` reaches the end.
pub fn emit_copy_array_page() -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 2: n
    emit_page_len(&mut f, 0, 1, 2);
    // if n <= 0 → return 0
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::I32LeS);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    // memory.copy(TRANSFER_BUFFER, handle.data + offset, n)
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_OFFSET as i32));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load(memarg(0, 2)));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::End);
    f
}

/// Emit `set_init_opts(len: i32) -> i32`.
///
/// Copies a single-window options blob out of the transfer window into a
/// fresh array stored in `GLOBAL_INIT_OPTS`.  Returns 0 when `len` does not
/// fit in one window.
pub fn emit_set_init_opts(ix: HelperIndices) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 1: array
    // if len > TRANSFER_BUFFER_SIZE → return 0
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_SIZE as i32));
    f.instruction(&Instruction::I32GtU);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    // array = create_array(len); commit_array_page(array, 0)
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::Call(ix.create_array));
    f.instruction(&Instruction::LocalTee(1));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Call(ix.commit_array_page));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::GlobalSet(GLOBAL_INIT_OPTS));

    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::End);
    f
}

// ══════════════════════════════════════════════════════════════════════════════
// Struct helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Emit `slot_addr = handle + offset_of(slot)` into local `out`; traps on an
/// unknown slot index.
fn emit_slot_address(f: &mut Function, st: &StructType, handle: u32, slot: u32, out: u32) {
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalSet(out));
    for (i, array_slot) in st.array_slots().iter().enumerate() {
        f.instruction(&Instruction::LocalGet(slot));
        f.instruction(&Instruction::I32Const(i as i32));
        f.instruction(&Instruction::I32Eq);
        f.instruction(&Instruction::If(BlockType::Empty));
        f.instruction(&Instruction::LocalGet(handle));
        f.instruction(&Instruction::I32Const(array_slot.offset as i32));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalSet(out));
        f.instruction(&Instruction::End);
    }
    f.instruction(&Instruction::LocalGet(out));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
}

/// Emit `materialize_struct_T_fields() -> i32`.
///
/// Copies the packed fields out of the transfer window into a new block.
/// String slots start out as the empty array (address 0).
pub fn emit_materialize_struct(st: &StructType, ix: HelperIndices) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 0: block
    f.instruction(&Instruction::I32Const(st.size() as i32));
    f.instruction(&Instruction::Call(ix.alloc));
    f.instruction(&Instruction::LocalSet(0));
    // memory.copy(block, TRANSFER_BUFFER, size)
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_OFFSET as i32));
    f.instruction(&Instruction::I32Const(st.size() as i32));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    for slot in st.array_slots() {
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::I32Store(memarg(slot.offset as u64, 2)));
    }
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::End);
    f
}

/// Emit `commit_struct_T_array(handle, slot, offset, len)`.
///
/// The first page (`offset == 0`) allocates a `len`-byte array for the slot.
pub fn emit_commit_struct_array(st: &StructType, ix: HelperIndices) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 4: slot_addr
    emit_slot_address(&mut f, st, 0, 1, 4);
    // if offset == 0 { *slot_addr = create_array(len) }
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::Call(ix.create_array));
    f.instruction(&Instruction::I32Store(memarg(0, 2)));
    f.instruction(&Instruction::End);
    // commit_array_page(*slot_addr, offset)
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::I32Load(memarg(0, 2)));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::Call(ix.commit_array_page));
    f.instruction(&Instruction::End);
    f
}

/// Emit `extract_struct_T_fields(handle) -> i32`.
///
/// Copies the packed fields into the transfer window; returns the number of
/// array slots.
pub fn emit_extract_struct_fields(st: &StructType) -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(TRANSFER_BUFFER_OFFSET as i32));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(st.size() as i32));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    f.instruction(&Instruction::I32Const(st.array_slots().len() as i32));
    f.instruction(&Instruction::End);
    f
}

/// Emit `extract_struct_T_array(handle, slot, offset) -> i32`.
pub fn emit_extract_struct_array(st: &StructType, ix: HelperIndices) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 3: slot_addr
    emit_slot_address(&mut f, st, 0, 1, 3);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Load(memarg(0, 2)));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::Call(ix.copy_array_page));
    f.instruction(&Instruction::End);
    f
}
