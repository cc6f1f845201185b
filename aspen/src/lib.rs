mod block;
mod finalizer;
mod heap;
mod object;
mod process;
mod scavenger;
mod scheduler;
mod stack;
mod system;

pub use block::{BLOCK_SIZE, Block, BlockPool, RESERVE_FLOOR};
pub use finalizer::{VmFinalizer, WeakFinalizer};
pub use heap::{
    AllocFailure, EXTERNAL_ALLOCATION_OVERHEAD, Heap, HeapCreateInfo, ObjectHeap, ObjectIter,
};
pub use object::{
    ArrayObject, ByteArrayObject, ExternalBytesObject, Header, ObjectKind, StackObject,
    TASK_FIELDS, TASK_STACK_SLOT, TaskObject, TypeTag, Value, ValueTag, WORD_SIZE,
};
pub use process::{Preemption, Process, ProcessId, ProcessInfo, ProcessState};
pub use scavenger::ScavengeStats;
pub use scheduler::{CrossGcStats, MAX_ALLOCATION_RETRIES, PREEMPTION_TIMEOUT, Scheduler};
pub use stack::{
    STACK_MAX_LENGTH, STACK_OVERFLOW_HEADROOM, STACK_SHRINK_FACTOR, StackCheck, StackOverflow,
    check_stack, grow_stack,
};
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
