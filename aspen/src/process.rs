use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::ObjectHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Scheduled,
    Running,
    Terminating,
    SuspendedIdle,
    SuspendedScheduled,
    SuspendedAwaitingGc,
}

impl ProcessState {
    /// A quiescent process is not executing; its heap may be collected by
    /// the coordinator.
    pub fn is_quiescent(self) -> bool {
        matches!(
            self,
            ProcessState::Idle
                | ProcessState::SuspendedIdle
                | ProcessState::SuspendedScheduled
                | ProcessState::SuspendedAwaitingGc
        )
    }
}

/// Cooperative preemption watermark, read by the interpreter at safepoints.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preemption {
    Running = 0,
    Requested = 1,
    Preempted = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug)]
pub struct ProcessInfo {
    pub state: ProcessState,
    /// Schedulable state to restore once a cross-process pass releases us.
    pub resume: ProcessState,
}

/// One logical process: an object heap plus scheduling state. The heap is
/// mutated only by the owning thread, or by the GC coordinator once the
/// owner has quiesced; the mutex makes that protocol checkable.
pub struct Process {
    pub id: ProcessId,
    pub info: Mutex<ProcessInfo>,
    preemption: AtomicU8,
    pub heap: Mutex<ObjectHeap>,
    root: bool,
}

impl Process {
    pub(crate) fn new(id: ProcessId, heap: ObjectHeap, root: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            info: Mutex::new(ProcessInfo {
                state: ProcessState::Idle,
                resume: ProcessState::Idle,
            }),
            preemption: AtomicU8::new(Preemption::Running as u8),
            heap: Mutex::new(heap),
            root,
        })
    }

    pub fn state(&self) -> ProcessState {
        self.info.lock().state
    }

    /// The boot process: exhausting it brings down the whole VM.
    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn preemption(&self) -> Preemption {
        match self.preemption.load(Ordering::Acquire) {
            0 => Preemption::Running,
            1 => Preemption::Requested,
            2 => Preemption::Preempted,
            other => unreachable!("invalid preemption state {other}"),
        }
    }

    pub(crate) fn set_preemption(&self, state: Preemption) {
        self.preemption.store(state as u8, Ordering::Release);
    }

    /// Forces the watermark from another thread; the owner reacts at its
    /// next safepoint.
    pub fn request_preemption(&self) {
        self.set_preemption(Preemption::Requested);
    }
}
