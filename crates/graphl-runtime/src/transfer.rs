//! The fixed-size window shared by host and guest for all byte streaming.
//!
//! Every access takes a fresh view of guest memory: a guest call may grow
//! memory, which invalidates any slice taken before it.

use std::ops::Range;

use graphl_types::TRANSFER_BUFFER_SIZE;
use wasmi::{AsContext, AsContextMut, Memory};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::HostState;

/// A `TRANSFER_BUFFER_SIZE`-byte window at a fixed offset in guest memory.
#[derive(Debug, Clone, Copy)]
pub struct TransferBuffer {
    memory: Memory,
    base: usize,
}

impl TransferBuffer {
    pub const SIZE: usize = TRANSFER_BUFFER_SIZE as usize;

    /// Bind the window at `base`, checking that it lies inside memory.
    pub fn new(
        memory: Memory,
        base: u32,
        ctx: &impl AsContext<Data = HostState>,
    ) -> RuntimeResult<Self> {
        let buffer = Self {
            memory,
            base: base as usize,
        };
        buffer.range(0, Self::SIZE, memory.data(ctx).len())?;
        Ok(buffer)
    }

    pub fn base(&self) -> u32 {
        self.base as u32
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Copy `bytes` into the window at `offset`.
    pub fn write<C>(&self, ctx: &mut C, offset: usize, bytes: &[u8]) -> RuntimeResult<()>
    where
        C: AsContextMut<Data = HostState>,
    {
        let data = self.memory.data_mut(ctx);
        let range = self.range(offset, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes out of the window starting at `offset`.
    pub fn read<C>(&self, ctx: &C, offset: usize, len: usize) -> RuntimeResult<Vec<u8>>
    where
        C: AsContext<Data = HostState>,
    {
        let data = self.memory.data(ctx);
        let range = self.range(offset, len, data.len())?;
        Ok(data[range].to_vec())
    }

    fn range(&self, offset: usize, len: usize, memory_len: usize) -> RuntimeResult<Range<usize>> {
        window_range(self.base, offset, len, memory_len)
    }
}

/// Absolute memory range for `len` bytes at `offset` into the window.
fn window_range(
    base: usize,
    offset: usize,
    len: usize,
    memory_len: usize,
) -> RuntimeResult<Range<usize>> {
    let out_of_bounds = || RuntimeError::TransferBufferOutOfBounds { offset, len };
    let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > TransferBuffer::SIZE {
        return Err(out_of_bounds());
    }
    let start = base.checked_add(offset).ok_or_else(out_of_bounds)?;
    let stop = base + end;
    if stop > memory_len {
        return Err(out_of_bounds());
    }
    Ok(start..stop)
}
