//! Copying collector. Live objects are evacuated into fresh to-space blocks
//! (Cheney scan, breadth first); the origin header is overwritten with a
//! forwarding record so shared sub-objects and cycles copy exactly once.
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{
    AllocFailure, Block, BlockPool, ExternalBytesObject, Header, ObjectHeap, ObjectKind,
    StackObject, TypeTag, Value, object,
    stack::{STACK_OVERFLOW_HEADROOM, STACK_SHRINK_FACTOR},
};

#[derive(Debug, Default, Clone, Copy)]
pub struct ScavengeStats {
    pub blocks_before: usize,
    pub blocks_after: usize,
    pub bytes_copied: usize,
    pub finalizers_made_runnable: usize,
    pub external_bytes_freed: usize,
}

/// Whether a weakly-held value survived the trace so far.
enum Reach {
    Survives(Value),
    Dead,
}

pub(crate) struct Scavenger {
    pool: Arc<BlockPool>,
    from_space: Vec<Range<usize>>,
    read_only: Vec<Range<usize>>,
    to_space: Vec<Block>,
    scan_block: usize,
    scan_offset: usize,
    bytes_copied: usize,
}

impl Scavenger {
    fn new(
        pool: Arc<BlockPool>,
        from_space: Vec<Range<usize>>,
        read_only: Vec<Range<usize>>,
    ) -> Result<Self, AllocFailure> {
        let first = pool.acquire_during_scavenge()?;
        Ok(Self {
            pool,
            from_space,
            read_only,
            to_space: vec![first],
            scan_block: 0,
            scan_offset: 0,
            bytes_copied: 0,
        })
    }

    fn in_from_space(&self, addr: usize) -> bool {
        self.from_space.iter().any(|range| range.contains(&addr))
    }

    fn in_read_only(&self, addr: usize) -> bool {
        self.read_only.iter().any(|range| range.contains(&addr))
    }

    /// Rewrites one root or field slot. Referents in a read-only range are
    /// never collected; slots already pointing outside from-space were
    /// handled earlier.
    ///
    /// # Safety
    /// `slot` must be valid for reads and writes.
    unsafe fn scavenge_slot(&mut self, slot: *mut Value) {
        // SAFETY: slot is valid per contract
        let value = unsafe { slot.read() };
        let Some(ptr) = value.as_object_ptr() else {
            return;
        };
        let addr = ptr.as_ptr() as usize;
        if self.in_read_only(addr) {
            return;
        }
        if !self.in_from_space(addr) {
            return;
        }
        // SAFETY: from-space is still mapped; every object starts with a header
        let word = unsafe { ptr.cast::<u64>().read() };
        let to = match Header::decode(word) {
            Header::Forwarded(to) => to,
            Header::Live(tag) => {
                let to = self.copy_object(ptr, tag);
                // SAFETY: the origin header slot is writable
                unsafe { ptr.cast::<u64>().write(Header::Forwarded(to).encode()) };
                to
            }
        };
        // SAFETY: slot is valid per contract
        unsafe { slot.write(Value::from_object(to)) };
    }

    fn copy_object(&mut self, from: NonNull<u8>, tag: TypeTag) -> NonNull<u8> {
        if let Some(to) = self.special_copy(from, tag) {
            return to;
        }
        let size = object::size_for(tag);
        let to = self.allocate_to_space(size);
        // SAFETY: from and to are distinct regions of `size` bytes
        unsafe { std::ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), size) };
        self.bytes_copied += size;
        to
    }

    /// Capability hook: an object kind may substitute a resized copy for the
    /// bitwise one. Stacks opt in and shrink on the way over.
    fn special_copy(&mut self, from: NonNull<u8>, tag: TypeTag) -> Option<NonNull<u8>> {
        match tag.kind {
            ObjectKind::Stack => self.copy_stack(from),
            _ => None,
        }
    }

    /// Copies only the live suffix plus fixed headroom when the stack has
    /// drained far below its allocated length, bounding long-term stack
    /// memory without a separate compaction pass.
    fn copy_stack(&mut self, from: NonNull<u8>) -> Option<NonNull<u8>> {
        // SAFETY: from references a live stack object
        let stack = unsafe { from.cast::<StackObject>().as_ref() };
        let length = stack.length();
        let live = length - stack.top();
        let shrunk = live + STACK_OVERFLOW_HEADROOM;
        if shrunk * STACK_SHRINK_FACTOR > length {
            return None;
        }
        let size = StackObject::required_size(shrunk);
        let to = self.allocate_to_space(size);
        // SAFETY: just allocated with the required size
        let mut copy = unsafe { StackObject::init(to, shrunk) };
        // SAFETY: just initialized
        let copy = unsafe { copy.as_mut() };
        copy.set_top(STACK_OVERFLOW_HEADROOM);
        for (i, &value) in stack.live_slots().iter().enumerate() {
            copy.set_slot(STACK_OVERFLOW_HEADROOM + i, value);
        }
        self.bytes_copied += size;
        Some(to)
    }

    fn allocate_to_space(&mut self, size: usize) -> NonNull<u8> {
        if let Some(ptr) = self.to_space.last_mut().and_then(|block| block.allocate(size)) {
            return ptr;
        }
        let mut block = self
            .pool
            .acquire_during_scavenge()
            .expect("block reserve exhausted mid-collection");
        let ptr = block.allocate(size).expect("a fresh block fits any object");
        self.to_space.push(block);
        ptr
    }

    /// Processes the to-space worklist until the scan cursor catches up with
    /// the bump cursor.
    fn drain(&mut self) {
        loop {
            let (base, used) = {
                let block = &self.to_space[self.scan_block];
                (block.base(), block.used())
            };
            if self.scan_offset < used {
                // SAFETY: the used prefix of a to-space block is object packed
                let obj = unsafe { base.add(self.scan_offset) };
                // SAFETY: every copy starts with a header word
                let word = unsafe { obj.cast::<u64>().read() };
                let tag = match Header::decode(word) {
                    Header::Live(tag) => tag,
                    Header::Forwarded(_) => panic!("forwarding record in to-space"),
                };
                // SAFETY: obj is a live copy matching tag
                let (slots, count) = unsafe { object::value_slots(obj, tag) };
                for i in 0..count {
                    // SAFETY: slot i is within the copied object
                    unsafe { self.scavenge_slot(slots.add(i)) };
                }
                self.scan_offset += object::size_for(tag);
                continue;
            }
            if self.scan_block + 1 < self.to_space.len() {
                self.scan_block += 1;
                self.scan_offset = 0;
                continue;
            }
            return;
        }
    }

    fn reach(&self, value: Value) -> Reach {
        let Some(ptr) = value.as_object_ptr() else {
            return Reach::Survives(value);
        };
        let addr = ptr.as_ptr() as usize;
        if self.in_read_only(addr) || !self.in_from_space(addr) {
            return Reach::Survives(value);
        }
        // SAFETY: from-space is still mapped
        let word = unsafe { ptr.cast::<u64>().read() };
        match Header::decode(word) {
            Header::Forwarded(to) => Reach::Survives(Value::from_object(to)),
            Header::Live(_) => Reach::Dead,
        }
    }

    fn finish(self) -> (Vec<Block>, usize) {
        (self.to_space, self.bytes_copied)
    }
}

impl ObjectHeap {
    /// Collects this heap, returning the number of blocks given back to the
    /// pool. Callable only by the owning thread, or by the GC coordinator
    /// after the owner has quiesced.
    pub fn scavenge(&mut self) -> usize {
        let own = self.heap.block_count();
        self.scavenge_with_reserve_hint(own)
    }

    pub(crate) fn scavenge_with_reserve_hint(&mut self, largest_heap_blocks: usize) -> usize {
        let pool = self.heap.pool().clone();
        pool.enter_scavenge();

        let blocks_before = self.heap.block_count();
        let from_space = self.heap.block_ranges();
        let mut scavenger = Scavenger::new(pool.clone(), from_space, self.read_only.clone())
            .expect("block reserve exhausted at collection start");

        // roots, in registration order: globals, task, spawn arguments,
        // external roots, notifiers, finalizer nodes
        for slot in &mut self.globals {
            // SAFETY: the slot lives for the whole collection
            unsafe { scavenger.scavenge_slot(slot) };
        }
        // SAFETY: see above
        unsafe { scavenger.scavenge_slot(&mut self.task) };
        for slot in &mut self.spawn_arguments {
            // SAFETY: see above
            unsafe { scavenger.scavenge_slot(slot) };
        }
        for slot in &self.external_roots {
            // SAFETY: registered slots stay valid until removed
            unsafe { scavenger.scavenge_slot(slot.as_ptr()) };
        }
        for slot in &mut self.notifiers {
            // SAFETY: the slot lives for the whole collection
            unsafe { scavenger.scavenge_slot(slot) };
        }
        for node in &mut self.runnable {
            // callbacks already queued must survive until they have run
            // SAFETY: the slot lives for the whole collection
            unsafe { scavenger.scavenge_slot(&mut node.callback) };
        }
        scavenger.drain();

        // weak sweeps may resurrect objects through kept callbacks, so the
        // worklist is drained after every pass until nothing moves; vm
        // finalizers are judged only once reachability is final
        let mut made_runnable = 0;
        loop {
            let moved = self.sweep_weak_finalizers(&mut scavenger);
            scavenger.drain();
            if moved == 0 {
                break;
            }
            made_runnable += moved;
        }
        let external_freed = self.sweep_vm_finalizers(&mut scavenger);
        scavenger.drain();

        let (to_blocks, bytes_copied) = scavenger.finish();
        let blocks_after = to_blocks.len();
        let old_blocks = self.heap.replace_blocks(to_blocks);
        for mut block in old_blocks {
            block.wipe();
            pool.release(block);
        }

        self.pending_limit = self.compute_pending_limit();
        self.last_scavenge = ScavengeStats {
            blocks_before,
            blocks_after,
            bytes_copied,
            finalizers_made_runnable: made_runnable,
            external_bytes_freed: external_freed,
        };
        log::debug!(
            "scavenge: {blocks_before} -> {blocks_after} blocks, {bytes_copied} bytes copied, \
             {made_runnable} finalizer(s) runnable, {external_freed} external bytes freed"
        );

        pool.leave_scavenge(largest_heap_blocks.max(blocks_after));
        blocks_before.saturating_sub(blocks_after)
    }

    /// One pass over the registered weak finalizers. Keys judged against the
    /// roots found so far: survivors get their slot retraced, dead keys are
    /// cleared and the node becomes runnable exactly once.
    fn sweep_weak_finalizers(&mut self, scavenger: &mut Scavenger) -> usize {
        let mut kept = Vec::with_capacity(self.finalizers.len());
        let mut moved = 0;
        for mut node in std::mem::take(&mut self.finalizers) {
            match scavenger.reach(node.key) {
                Reach::Survives(key) => {
                    node.key = key;
                    // SAFETY: node lives on this frame during the call
                    unsafe { scavenger.scavenge_slot(&mut node.callback) };
                    kept.push(node);
                }
                Reach::Dead => {
                    node.key = Value::zero();
                    // SAFETY: node lives on this frame during the call
                    unsafe { scavenger.scavenge_slot(&mut node.callback) };
                    self.runnable.push_back(node);
                    moved += 1;
                }
            }
        }
        self.finalizers = kept;
        moved
    }

    /// Dead keys release their off-heap buffer immediately; the corpse is
    /// still intact in from-space at this point. Returns bytes freed.
    fn sweep_vm_finalizers(&mut self, scavenger: &mut Scavenger) -> usize {
        let mut kept = Vec::with_capacity(self.vm_finalizers.len());
        let mut freed = 0;
        for mut node in std::mem::take(&mut self.vm_finalizers) {
            match scavenger.reach(node.key) {
                Reach::Survives(key) => {
                    node.key = key;
                    kept.push(node);
                }
                Reach::Dead => {
                    // SAFETY: vm finalizer keys reference external-bytes objects
                    let mut external = unsafe { ExternalBytesObject::from_value(node.key) };
                    // SAFETY: the object is unreachable and was never copied
                    let len = unsafe { external.as_ref() }.len();
                    // SAFETY: see above
                    unsafe { external.as_mut().release_buffer() };
                    self.unregister_external_allocation(len);
                    freed += len;
                }
            }
        }
        self.vm_finalizers = kept;
        freed
    }
}
