use crate::Value;

/// User-level finalizer. The key is weakly held: registration alone never
/// keeps it alive. Once the key is proven dead the node moves to the heap's
/// runnable queue with the key cleared, and the callback survives until it
/// has been handed out through `next_finalizer_to_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakFinalizer {
    pub key: Value,
    pub callback: Value,
}

/// VM-level finalizer for objects owning off-heap buffers. When the key dies
/// the buffer is released immediately during the sweep and the node is
/// destroyed; there is no user-visible callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmFinalizer {
    pub key: Value,
}
