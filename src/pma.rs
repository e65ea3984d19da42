//! Buddy allocator over the single DMA-capable region backing EHCI/xHCI
//! descriptors and buffers. A line-for-line port of the bookkeeping in
//! `PhysicalMemoryAllocator.cpp`: a power-of-two ladder of byte arrays,
//! one entry per block at that granularity, `0` meaning free.
//!
//! Allocation scans the array for the requested granularity from a
//! rotating cursor; on success it fills every finer sub-block under the
//! hit as allocated and bumps the covering-reservation counter on every
//! coarser block containing it. Deallocation is the exact inverse.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KError, KResult};
use crate::platform::Platform;
use crate::sync::IrqSafeMutex;

/// How long an allocation waits before rescanning when the arena is full.
/// The original blocks on a condition variable signaled by `Deallocate`;
/// without a park/unpark primitive in `Platform`, waiting is approximated
/// as a bounded poll loop driven by `Platform::sleep_us` (see DESIGN.md).
const WAIT_POLL_US: u64 = 200;
const WAIT_MAX_POLLS: u32 = 10_000;

struct Levels {
    /// Size in bytes of one block at this level.
    block_size: Vec<usize>,
    /// Number of blocks (= byte-array length) at this level.
    array_length: Vec<usize>,
}

struct PmaState {
    arrays: Vec<Vec<u8>>,
    array_offset: Vec<usize>,
    waiters: u32,
}

pub struct PhysicalMemoryAllocator {
    platform: Arc<dyn Platform>,
    levels: Levels,
    logical_base: *mut u8,
    physical_base: u64,
    managed_memory: usize,
    state: IrqSafeMutex<PmaState>,
}

// SAFETY: `logical_base` is a raw pointer into the platform's DMA region;
// all mutation of the bytes it addresses goes through `state`'s lock, and
// the pointer itself is never written to after construction.
unsafe impl Send for PhysicalMemoryAllocator {}
unsafe impl Sync for PhysicalMemoryAllocator {}

impl PhysicalMemoryAllocator {
    /// `min_size`/`max_size` must be powers of two; `max_size` is rounded
    /// up internally to the next doubling of `min_size` exactly as the
    /// original does (the "biggest size" may exceed the literal `max_size`
    /// argument).
    pub fn new(
        platform: Arc<dyn Platform>,
        min_size: usize,
        max_size: usize,
        min_count_per_block: usize,
    ) -> KResult<Self> {
        if min_size == 0 || max_size < min_size || min_count_per_block == 0 {
            return Err(KError::BadValue);
        }

        let mut array_count = 1usize;
        let mut biggest_size = min_size;
        while biggest_size < max_size {
            array_count += 1;
            biggest_size *= 2;
        }

        let mut block_size = alloc::vec![0usize; array_count];
        let mut array_length = alloc::vec![0usize; array_count];
        let mut array_slots = biggest_size / min_size;
        let mut arrays = Vec::with_capacity(array_count);
        for i in 0..array_count {
            array_length[i] = array_slots * min_count_per_block;
            block_size[i] = biggest_size / array_slots;
            arrays.push(alloc::vec![0u8; array_length[i]]);
            array_slots /= 2;
        }

        let managed_memory = block_size[0] * array_length[0];
        let region = platform.dma_region();
        if region.size < managed_memory {
            return Err(KError::NoMemory);
        }

        Ok(PhysicalMemoryAllocator {
            platform,
            levels: Levels { block_size, array_length },
            logical_base: region.logical_base,
            physical_base: region.physical_base,
            managed_memory,
            state: IrqSafeMutex::new(PmaState {
                arrays,
                array_offset: alloc::vec![0usize; array_count],
                waiters: 0,
            }),
        })
    }

    pub fn managed_memory(&self) -> usize {
        self.managed_memory
    }

    pub fn max_block_size(&self) -> usize {
        *self.levels.block_size.last().unwrap()
    }

    fn array_for_size(&self, size: usize) -> Option<usize> {
        self.levels.block_size.iter().position(|&b| b >= size)
    }

    /// Returns (logical pointer, physical address).
    pub fn allocate(&self, size: usize) -> KResult<(*mut u8, u64)> {
        if size == 0 || size > self.max_block_size() {
            return Err(KError::BadValue);
        }
        let array_to_use = self.array_for_size(size).ok_or(KError::BadValue)?;
        let array_length = self.levels.array_length[array_to_use];

        let mut polls = 0u32;
        loop {
            {
                let mut state = self.state.lock(&*self.platform);
                let cursor = state.array_offset[array_to_use] % array_length;
                let mut i = cursor;
                loop {
                    i = if i + 1 >= array_length { 0 } else { i + 1 };
                    if i == cursor {
                        break;
                    }
                    if state.arrays[array_to_use][i] == 0 {
                        state.array_offset[array_to_use] = i;
                        self.mark_allocated(&mut state, array_to_use, i);
                        let offset = self.levels.block_size[array_to_use] * i;
                        let logical = unsafe { self.logical_base.add(offset) };
                        let physical = self.physical_base + offset as u64;
                        return Ok((logical, physical));
                    }
                }
                state.waiters += 1;
            }

            polls += 1;
            if polls > WAIT_MAX_POLLS {
                return Err(KError::NoMemory);
            }
            self.platform.sleep_us(WAIT_POLL_US);
            let mut state = self.state.lock(&*self.platform);
            state.waiters -= 1;
        }
    }

    fn mark_allocated(&self, state: &mut PmaState, array_to_use: usize, index: usize) {
        // Fill downward (finer arrays) to the smallest block.
        let mut fill_size = 1usize;
        let mut array_index = index;
        for j in (0..=array_to_use).rev() {
            let end = array_index + fill_size;
            state.arrays[j][array_index..end].fill(1);
            fill_size <<= 1;
            array_index <<= 1;
        }

        // Bump coarser arrays' covering-reservation counters.
        let mut array_index = index >> 1;
        for j in (array_to_use + 1)..self.levels.block_size.len() {
            state.arrays[j][array_index] += 1;
            if state.arrays[j][array_index] > 1 {
                break;
            }
            array_index >>= 1;
        }
    }

    /// Either `logical` or `physical` must be `Some`; both addresses must
    /// have originated from an `allocate` call of the same `size`.
    pub fn deallocate(&self, size: usize, logical: Option<*mut u8>, physical: Option<u64>) -> KResult<()> {
        if size == 0 || size > self.max_block_size() {
            return Err(KError::BadValue);
        }
        let array_to_use = self.array_for_size(size).ok_or(KError::BadValue)?;

        let offset = if let Some(l) = logical {
            (l as usize).wrapping_sub(self.logical_base as usize)
        } else if let Some(p) = physical {
            (p - self.physical_base) as usize
        } else {
            return Err(KError::BadValue);
        };

        let index = offset / self.levels.block_size[array_to_use];
        if index >= self.levels.array_length[array_to_use] {
            return Err(KError::BadValue);
        }

        let mut state = self.state.lock(&*self.platform);
        if state.arrays[array_to_use][index] == 0 {
            return Err(KError::BadValue);
        }

        let mut fill_size = 1usize;
        let mut array_index = index;
        for j in (0..=array_to_use).rev() {
            let end = array_index + fill_size;
            state.arrays[j][array_index..end].fill(0);
            fill_size <<= 1;
            array_index <<= 1;
        }

        let mut array_index = index >> 1;
        for j in (array_to_use + 1)..self.levels.block_size.len() {
            state.arrays[j][array_index] -= 1;
            if state.arrays[j][array_index] > 0 {
                break;
            }
            array_index >>= 1;
        }

        Ok(())
    }
}
