use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{AllocFailure, WORD_SIZE, system};

pub const BLOCK_SIZE: usize = 32 * 1024;

/// Smallest reserve the pool keeps mapped even when every heap is tiny.
#[cfg(feature = "low-memory")]
pub const RESERVE_FLOOR: usize = 1;
#[cfg(not(feature = "low-memory"))]
pub const RESERVE_FLOOR: usize = 4;

/// Fixed-size bump arena, the unit of heap growth. Owned by a heap while in
/// use and by the pool while free; `top` only ever moves forward between
/// wipes.
#[derive(Debug)]
pub struct Block {
    base: NonNull<u8>,
    top: usize,
}

// SAFETY: a block is exclusively owned; ownership transfers hand over the
// whole arena
unsafe impl Send for Block {}

impl Block {
    fn map() -> Option<Block> {
        let base = system::map_memory(BLOCK_SIZE)?;
        Some(Block { base, top: 0 })
    }

    fn unmap(self) {
        system::unmap_memory(self.base, BLOCK_SIZE);
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size.is_multiple_of(WORD_SIZE), "allocations are word sized");
        if self.top + size > BLOCK_SIZE {
            return None;
        }
        // SAFETY: top + size is within the mapping
        let ptr = unsafe { self.base.add(self.top) };
        self.top += size;
        Some(ptr)
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn used(&self) -> usize {
        self.top
    }

    pub fn remaining(&self) -> usize {
        BLOCK_SIZE - self.top
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base_addr();
        addr >= base && addr < base + BLOCK_SIZE
    }

    /// Address range of the whole arena.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.base_addr()..self.base_addr() + BLOCK_SIZE
    }

    /// Zeroes the used prefix and rewinds `top`. Required before a block goes
    /// back to the pool.
    pub fn wipe(&mut self) {
        // SAFETY: the used prefix is within the mapping
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, self.top) };
        self.top = 0;
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<Block>,
    high_water: usize,
    /// Number of collections currently inside an enter/leave window. The
    /// reserve invariant is suspended while this is non-zero.
    scavenges: usize,
}

impl PoolInner {
    fn reserve_target(&self) -> usize {
        self.high_water.max(RESERVE_FLOOR)
    }

    fn replenish(&mut self) -> Result<(), AllocFailure> {
        let target = self.reserve_target();
        while self.free.len() < target {
            let block = Block::map().ok_or(AllocFailure::OutOfMemory)?;
            self.free.push(block);
        }
        Ok(())
    }
}

/// Process-wide free list of blocks shared by every heap. Outside a
/// collection window the free list always covers the high-water mark of
/// blocks owned by any single heap, so the largest heap can complete one
/// collection without asking the OS for memory.
#[derive(Debug)]
pub struct BlockPool {
    inner: Mutex<PoolInner>,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                high_water: 0,
                scavenges: 0,
            }),
        }
    }

    /// Hands out one block to grow a heap to `owner_blocks` blocks. A failure
    /// of the underlying memory source is a hard out-of-memory signal.
    pub fn acquire(&self, owner_blocks: usize) -> Result<Block, AllocFailure> {
        let mut inner = self.inner.lock();
        let block = match inner.free.pop() {
            Some(block) => block,
            None => Block::map().ok_or(AllocFailure::OutOfMemory)?,
        };
        if owner_blocks > inner.high_water {
            inner.high_water = owner_blocks;
        }
        if inner.scavenges == 0 {
            if let Err(failure) = inner.replenish() {
                inner.free.push(block);
                return Err(failure);
            }
        }
        Ok(block)
    }

    /// Variant used by a collector for to-space growth. Never replenishes the
    /// reserve and never triggers a collection of its own.
    pub fn acquire_during_scavenge(&self) -> Result<Block, AllocFailure> {
        let mut inner = self.inner.lock();
        assert!(
            inner.scavenges > 0,
            "acquire_during_scavenge outside a collection window"
        );
        match inner.free.pop() {
            Some(block) => Ok(block),
            None => Block::map().ok_or(AllocFailure::OutOfMemory),
        }
    }

    pub fn release(&self, block: Block) {
        debug_assert!(block.used() == 0, "blocks must be wiped before release");
        let mut inner = self.inner.lock();
        inner.free.push(block);
    }

    pub fn enter_scavenge(&self) {
        let mut inner = self.inner.lock();
        inner.scavenges += 1;
    }

    /// Closes a collection window. Recomputes the reserve from the largest
    /// heap alive, tops the free list back up and trims the excess, keeping
    /// the lowest-address blocks to fight fragmentation on hosts without
    /// remappable virtual memory.
    pub fn leave_scavenge(&self, largest_heap_blocks: usize) {
        let mut inner = self.inner.lock();
        assert!(inner.scavenges > 0, "leave_scavenge without enter_scavenge");
        inner.scavenges -= 1;
        if inner.scavenges > 0 {
            return;
        }

        inner.high_water = largest_heap_blocks.saturating_sub(1).max(RESERVE_FLOOR);
        let target = inner.reserve_target();

        while inner.free.len() < target {
            match Block::map() {
                Some(block) => inner.free.push(block),
                None => {
                    log::error!("block pool reserve replenish failed at {} of {target}", inner.free.len());
                    break;
                }
            }
        }

        if inner.free.len() > target {
            inner.free.sort_unstable_by_key(Block::base_addr);
            while inner.free.len() > target {
                if let Some(block) = inner.free.pop() {
                    block.unmap();
                }
            }
        }
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().high_water
    }

    pub fn in_scavenge(&self) -> bool {
        self.inner.lock().scavenges > 0
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for block in inner.free.drain(..) {
            block.unmap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_moves_top_forward_only() {
        let mut block = Block::map().expect("map block");
        let a = block.allocate(16).expect("first allocation");
        let b = block.allocate(32).expect("second allocation");
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            16,
            "allocations must be adjacent"
        );
        assert_eq!(block.used(), 48);
        block.unmap();
    }

    #[test]
    fn full_block_refuses_allocation() {
        let mut block = Block::map().expect("map block");
        assert!(block.allocate(BLOCK_SIZE).is_some());
        assert!(block.allocate(WORD_SIZE).is_none(), "block is exhausted");
        block.unmap();
    }

    #[test]
    fn wipe_zeroes_used_prefix_and_rewinds() {
        let mut block = Block::map().expect("map block");
        let ptr = block.allocate(WORD_SIZE).expect("allocate");
        // SAFETY: just allocated
        unsafe { ptr.cast::<u64>().write(0xdead_beef) };
        block.wipe();
        assert_eq!(block.used(), 0);
        let again = block.allocate(WORD_SIZE).expect("allocate after wipe");
        assert_eq!(again, ptr, "wipe rewinds to the base");
        // SAFETY: just allocated
        assert_eq!(unsafe { again.cast::<u64>().read() }, 0, "wipe zeroes memory");
        block.unmap();
    }

    #[test]
    fn reserve_invariant_holds_outside_collection_windows() {
        let pool = BlockPool::new();
        let mut owned = Vec::new();
        for i in 1..=6 {
            owned.push(pool.acquire(i).expect("acquire"));
            assert!(
                pool.free_blocks() >= pool.high_water_mark(),
                "free list fell below the high-water mark after acquire {i}"
            );
        }
        for mut block in owned {
            block.wipe();
            pool.release(block);
            assert!(pool.free_blocks() >= pool.high_water_mark());
        }
    }

    #[test]
    fn acquire_during_scavenge_does_not_replenish() {
        let pool = BlockPool::new();
        let first = pool.acquire(1).expect("acquire");
        pool.enter_scavenge();
        let free_before = pool.free_blocks();
        let block = pool.acquire_during_scavenge().expect("scavenge acquire");
        assert_eq!(
            pool.free_blocks(),
            free_before - 1,
            "collection window must not top the free list back up"
        );
        pool.release({
            let mut b = block;
            b.wipe();
            b
        });
        pool.leave_scavenge(1);
        pool.release({
            let mut b = first;
            b.wipe();
            b
        });
    }

    #[test]
    #[should_panic(expected = "acquire_during_scavenge outside a collection window")]
    fn scavenge_acquire_outside_window_panics() {
        let pool = BlockPool::new();
        let _ = pool.acquire_during_scavenge();
    }

    #[test]
    fn leave_scavenge_trims_reserve_to_largest_heap() {
        let pool = BlockPool::new();
        // grow the high-water mark, then pretend the big heap shrank
        let blocks: Vec<_> = (1..=10).map(|i| pool.acquire(i).expect("acquire")).collect();
        for mut block in blocks {
            block.wipe();
            pool.release(block);
        }
        assert!(pool.free_blocks() >= 10);

        pool.enter_scavenge();
        pool.leave_scavenge(3);
        let target = 3usize.saturating_sub(1).max(RESERVE_FLOOR);
        assert_eq!(
            pool.free_blocks(),
            target,
            "excess reserve must be trimmed on leave"
        );
        assert!(!pool.in_scavenge());
    }

    #[test]
    fn released_blocks_are_recycled_before_mapping_new_ones() {
        let pool = BlockPool::new();
        let mut block = pool.acquire(1).expect("acquire");
        let addr = block.base_addr();
        block.wipe();
        pool.release(block);
        // the free list is address-agnostic outside leave_scavenge; the
        // released block sits on top and comes back first
        let again = pool.acquire(1).expect("acquire again");
        assert_eq!(again.base_addr(), addr, "released block should be recycled");
        pool.release({
            let mut b = again;
            b.wipe();
            b
        });
    }
}
