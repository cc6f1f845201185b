//! Call-stack growth. The interpreter checks remaining headroom against the
//! callee's static maximum height on call entry; the same check doubles as
//! the cooperative preemption safepoint via the watermark sentinel.
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{ObjectHeap, Preemption, Process, Scheduler, StackObject, TaskObject};

/// Hard maximum stack length, in value slots.
pub const STACK_MAX_LENGTH: usize = 2048;

/// Slots kept free above the live suffix when a stack is shrunk during copy.
pub const STACK_OVERFLOW_HEADROOM: usize = 32;

/// A stack shrinks during copy only when the surviving portion is at most
/// 1/FACTOR of its allocated length.
pub const STACK_SHRINK_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheck {
    Ok,
    /// The watermark was forced from another thread; yield instead of
    /// growing.
    Preempted,
    NeedsGrowth { deficit: usize },
}

/// Catchable overflow condition, routed through the interpreter's unwind
/// path rather than aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow;

fn current_stack(heap: &ObjectHeap) -> NonNull<StackObject> {
    // SAFETY: the task root always references a live task
    let task = unsafe { TaskObject::from_value(heap.task()) };
    // SAFETY: field 0 of a live task is its stack
    unsafe { StackObject::from_value(task.as_ref().stack()) }
}

/// Combined headroom / preemption check for call entry. The sentinel is
/// inspected first so a forced watermark is never mistaken for real
/// exhaustion.
pub fn check_stack(process: &Process, needed: usize) -> StackCheck {
    if process.preemption() == Preemption::Requested {
        return StackCheck::Preempted;
    }
    let heap = process.heap.lock();
    // SAFETY: resolved through the live task root
    let headroom = unsafe { current_stack(&heap).as_ref() }.headroom();
    if headroom >= needed {
        StackCheck::Ok
    } else {
        StackCheck::NeedsGrowth {
            deficit: needed - headroom,
        }
    }
}

/// Replaces the task's stack with a larger one and migrates the live
/// content. Growth is by half the current length or by the exact deficit,
/// whichever is larger, capped at [`STACK_MAX_LENGTH`]. Allocation goes
/// through the scheduler's retry ladder, so a collection may run (and may
/// move the old stack) before the copy happens.
pub fn grow_stack(
    scheduler: &Scheduler,
    process: &Arc<Process>,
    needed: usize,
) -> Result<(), StackOverflow> {
    let (length, headroom) = {
        let heap = process.heap.lock();
        // SAFETY: resolved through the live task root
        let stack = unsafe { current_stack(&heap).as_ref() };
        (stack.length(), stack.headroom())
    };
    if headroom >= needed {
        return Ok(());
    }
    let deficit = needed - headroom;
    let grown = (length + length / 2)
        .max(length + deficit)
        .min(STACK_MAX_LENGTH);
    if grown < length + deficit {
        return Err(StackOverflow);
    }

    let new_value = scheduler
        .allocate(process, |heap| heap.allocate_stack(grown))
        .map_err(|_| StackOverflow)?;

    let mut heap = process.heap.lock();
    // the ladder may have collected: resolve the old stack again through the
    // task root, it may have moved or shrunk
    // SAFETY: the task root references a live task
    let mut task = unsafe { TaskObject::from_value(heap.task()) };
    // SAFETY: a live task's stack is a live stack object
    let old = unsafe { StackObject::from_value(task.as_ref().stack()) };
    // SAFETY: the reference is dropped before the task is mutated
    let old = unsafe { old.as_ref() };
    // SAFETY: just allocated through the ladder
    let mut new = unsafe { StackObject::from_value(new_value) };
    // SAFETY: see above
    let new = unsafe { new.as_mut() };

    let live = old.live_slots();
    let new_top = new.length() - live.len();
    new.set_top(new_top);
    for (i, &value) in live.iter().enumerate() {
        new.set_slot(new_top + i, value);
    }
    // the swap is atomic from the interpreter's point of view: nothing runs
    // on this task until we return
    // SAFETY: task is live
    unsafe { task.as_mut() }.set_stack(new_value);
    drop(heap);
    Ok(())
}
