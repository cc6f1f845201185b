//! Cross-thread GC coordination. A local collection runs synchronously on
//! the owning thread; a cross-process pass first quiesces every running
//! peer through the preemption watermark, then collects heap by heap.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{AllocFailure, BlockPool, ObjectHeap, Preemption, Process, ProcessId, ProcessState};

/// How long a coordinator waits for peers to reach a safepoint. Timing out
/// is tolerated; stuck threads are skipped for the pass.
pub const PREEMPTION_TIMEOUT: Duration = Duration::from_millis(100);

/// A failed allocation escalates through this many collection attempts
/// before it is surfaced to the caller.
pub const MAX_ALLOCATION_RETRIES: usize = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct CrossGcStats {
    pub quiesced: usize,
    pub timed_out: usize,
    pub heaps_scavenged: usize,
    pub blocks_reclaimed: usize,
}

#[derive(Debug, Default)]
struct CrossGcSync {
    collecting: bool,
    pending_preemptions: usize,
    last_pass: CrossGcStats,
}

struct SchedulerShared {
    pool: Arc<BlockPool>,
    processes: RwLock<Vec<Arc<Process>>>,
    sync: Mutex<CrossGcSync>,
    /// Signalled by threads reaching their safepoint; the coordinator waits
    /// here for the pending count to drain.
    quiesced: Condvar,
    /// Signalled when a cross-process pass completes.
    released: Condvar,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self {
            inner: Arc::new(SchedulerShared {
                pool,
                processes: RwLock::new(Vec::new()),
                sync: Mutex::new(CrossGcSync::default()),
                quiesced: Condvar::new(),
                released: Condvar::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.inner.pool
    }

    pub fn spawn_process(&self, root: bool) -> Result<Arc<Process>, AllocFailure> {
        let heap = ObjectHeap::new(self.inner.pool.clone())?;
        let id = ProcessId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let process = Process::new(id, heap, root);
        self.inner.processes.write().push(process.clone());
        Ok(process)
    }

    /// Unregisters a terminating process. Its heap hands every block back to
    /// the pool once the last reference drops.
    pub fn remove_process(&self, process: &Arc<Process>) {
        self.process_state_transition(process, ProcessState::Terminating);
        self.inner
            .processes
            .write()
            .retain(|registered| registered.id != process.id);
    }

    pub fn process_state_transition(&self, process: &Arc<Process>, new_state: ProcessState) {
        process.info.lock().state = new_state;
    }

    /// Feeds the pool's reserve sizing. Heaps whose owner is mid-allocation
    /// are skipped; the reserve catches up on the next pass.
    pub fn largest_heap_block_count(&self) -> usize {
        let processes = self.inner.processes.read();
        processes
            .iter()
            .filter_map(|process| process.heap.try_lock().map(|heap| heap.block_count()))
            .max()
            .unwrap_or(0)
    }

    pub fn last_cross_gc_stats(&self) -> CrossGcStats {
        self.inner.sync.lock().last_pass
    }

    /// Safepoint entry. Returns false when no preemption is pending. A
    /// preempted thread parks its process in SUSPENDED_AWAITING_GC, signals
    /// the coordinator and blocks until the pass completes, then restores
    /// its prior schedulable state.
    pub fn handle_preemption(&self, process: &Arc<Process>) -> bool {
        if process.preemption() != Preemption::Requested {
            return false;
        }
        process.set_preemption(Preemption::Preempted);
        {
            let mut info = process.info.lock();
            info.resume = match info.state {
                ProcessState::Running | ProcessState::Scheduled => ProcessState::Scheduled,
                ProcessState::Idle | ProcessState::SuspendedIdle => ProcessState::Idle,
                other => other,
            };
            info.state = ProcessState::SuspendedAwaitingGc;
        }
        let shared = &self.inner;
        let mut sync = shared.sync.lock();
        if sync.pending_preemptions > 0 {
            sync.pending_preemptions -= 1;
        }
        shared.quiesced.notify_one();
        while sync.collecting {
            shared.released.wait(&mut sync);
        }
        drop(sync);
        {
            let mut info = process.info.lock();
            if info.state == ProcessState::SuspendedAwaitingGc {
                info.state = info.resume;
            }
        }
        process.set_preemption(Preemption::Running);
        true
    }

    /// Quiesces every running peer (with `try_hard`), collects each
    /// quiescent heap and finally the requester's own, then releases the
    /// suspended threads. Never cancelled once started; threads that fail to
    /// quiesce in time are skipped for this pass.
    pub fn request_cross_process_gc(
        &self,
        requester: &Arc<Process>,
        try_hard: bool,
    ) -> CrossGcStats {
        let shared = &self.inner;
        let processes: Vec<Arc<Process>> = shared.processes.read().clone();

        let mut sync = shared.sync.lock();
        while sync.collecting {
            // another coordinator is mid-pass; wait it out and run our own
            shared.released.wait(&mut sync);
        }
        sync.collecting = true;

        let mut stats = CrossGcStats::default();
        let mut pending = 0;
        if try_hard {
            for process in &processes {
                if process.id == requester.id {
                    continue;
                }
                let running = process.info.lock().state == ProcessState::Running;
                if running {
                    process.request_preemption();
                    pending += 1;
                }
            }
        }
        sync.pending_preemptions = pending;
        if pending > 0 {
            let deadline = Instant::now() + PREEMPTION_TIMEOUT;
            while sync.pending_preemptions > 0 {
                if shared.quiesced.wait_until(&mut sync, deadline).timed_out() {
                    break;
                }
            }
            stats.timed_out = sync.pending_preemptions;
            stats.quiesced = pending - stats.timed_out;
            if stats.timed_out > 0 {
                log::warn!(
                    "cross-process gc: {} thread(s) failed to quiesce within {:?}, skipping them",
                    stats.timed_out,
                    PREEMPTION_TIMEOUT
                );
            }
        }
        drop(sync);

        // the byte-copying work happens outside the global lock
        let largest = self.largest_heap_block_count();
        for process in &processes {
            if process.id == requester.id {
                continue;
            }
            if !process.state().is_quiescent() {
                continue;
            }
            let Some(mut heap) = process.heap.try_lock() else {
                continue;
            };
            stats.blocks_reclaimed += heap.scavenge_with_reserve_hint(largest);
            heap.install_pending_limit();
            stats.heaps_scavenged += 1;
        }
        {
            let mut heap = requester.heap.lock();
            stats.blocks_reclaimed += heap.scavenge_with_reserve_hint(largest);
            heap.install_pending_limit();
            stats.heaps_scavenged += 1;
        }

        let mut sync = shared.sync.lock();
        sync.collecting = false;
        sync.last_pass = stats;
        drop(sync);
        shared.released.notify_all();
        stats
    }

    /// Collects heaps of processes that are sitting idle, recycling their
    /// blocks before a starved allocator retries.
    pub fn scavenge_idle_processes(&self, requester: &Arc<Process>) {
        let processes: Vec<Arc<Process>> = self.inner.processes.read().clone();
        let largest = self.largest_heap_block_count();
        for process in processes {
            if process.id == requester.id {
                continue;
            }
            if !matches!(
                process.state(),
                ProcessState::Idle | ProcessState::SuspendedIdle
            ) {
                continue;
            }
            let Some(mut heap) = process.heap.try_lock() else {
                continue;
            };
            heap.scavenge_with_reserve_hint(largest);
            heap.install_pending_limit();
        }
    }

    /// Allocation retry ladder: attempt, then local collection, then idle
    /// peers, then a forced cross-process pass. A fourth failure is fatal
    /// for the boot process and an error value for everyone else.
    ///
    /// The caller must not hold the process's heap lock.
    pub fn allocate<T>(
        &self,
        process: &Arc<Process>,
        mut op: impl FnMut(&mut ObjectHeap) -> Result<T, AllocFailure>,
    ) -> Result<T, AllocFailure> {
        let mut failure = AllocFailure::OutOfMemory;
        for attempt in 0..=MAX_ALLOCATION_RETRIES {
            {
                let mut heap = process.heap.lock();
                match op(&mut heap) {
                    Ok(value) => return Ok(value),
                    Err(reported) => failure = reported,
                }
            }
            match attempt {
                0 => {
                    let largest = self.largest_heap_block_count();
                    let mut heap = process.heap.lock();
                    heap.scavenge_with_reserve_hint(largest);
                    heap.install_pending_limit();
                }
                1 => self.scavenge_idle_processes(process),
                2 => {
                    self.request_cross_process_gc(process, true);
                }
                _ => break,
            }
        }
        if process.is_root() {
            log::error!(
                "boot process failed an allocation after {} attempts",
                MAX_ALLOCATION_RETRIES + 1
            );
            panic!("out of memory in the boot process");
        }
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn mk_scheduler() -> Scheduler {
        init_logs();
        Scheduler::new(Arc::new(BlockPool::new()))
    }

    #[test]
    fn spawned_processes_get_working_heaps() {
        let sched = mk_scheduler();
        let process = sched.spawn_process(false).expect("spawn");
        let value = sched
            .allocate(&process, |heap| heap.allocate_array(4))
            .expect("allocate through the ladder");
        assert!(value.is_reference());
        assert_eq!(sched.largest_heap_block_count(), 1);
    }

    #[test]
    fn ladder_recovers_from_hit_limit_with_a_local_collection() {
        let sched = mk_scheduler();
        let process = sched.spawn_process(false).expect("spawn");
        {
            let mut heap = process.heap.lock();
            heap.set_soft_limit(Some(2 * crate::BLOCK_SIZE));
            // fill with garbage until the limit refuses growth
            while heap.allocate_bytes_zeroed(1024).is_ok() {}
        }
        let value = sched
            .allocate(&process, |heap| heap.allocate_bytes_zeroed(1024))
            .expect("local scavenge must free enough room");
        assert!(value.is_reference());
    }

    #[test]
    fn ladder_surfaces_out_of_memory_for_ordinary_processes() {
        let sched = mk_scheduler();
        let process = sched.spawn_process(false).expect("spawn");
        let result: Result<(), AllocFailure> =
            sched.allocate(&process, |_| Err(AllocFailure::OutOfMemory));
        assert_eq!(result, Err(AllocFailure::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "out of memory in the boot process")]
    fn ladder_is_fatal_for_the_boot_process() {
        let sched = mk_scheduler();
        let process = sched.spawn_process(true).expect("spawn");
        let _: Result<(), AllocFailure> =
            sched.allocate(&process, |_| Err(AllocFailure::OutOfMemory));
    }

    #[test]
    fn cross_gc_quiesces_running_processes_and_releases_them() {
        let sched = mk_scheduler();
        let requester = sched.spawn_process(false).expect("spawn");
        let worker_a = sched.spawn_process(false).expect("spawn");
        let worker_b = sched.spawn_process(false).expect("spawn");
        sched.process_state_transition(&worker_a, ProcessState::Running);
        sched.process_state_transition(&worker_b, ProcessState::Running);

        let mut joins = Vec::new();
        for process in [worker_a.clone(), worker_b.clone()] {
            let sched = sched.clone();
            joins.push(thread::spawn(move || {
                // spin at the safepoint until the watermark is forced
                while !sched.handle_preemption(&process) {
                    thread::yield_now();
                }
            }));
        }

        let stats = sched.request_cross_process_gc(&requester, true);
        for join in joins {
            join.join().expect("worker thread");
        }

        assert_eq!(stats.quiesced, 2, "both running processes must reach the safepoint");
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.heaps_scavenged, 3, "two peers plus the requester");
        assert_eq!(
            worker_a.state(),
            ProcessState::Scheduled,
            "released back to a schedulable state"
        );
        assert_eq!(worker_b.state(), ProcessState::Scheduled);
    }

    #[test]
    fn cross_gc_tolerates_threads_that_never_quiesce() {
        let sched = mk_scheduler();
        let requester = sched.spawn_process(false).expect("spawn");
        let stuck = sched.spawn_process(false).expect("spawn");
        sched.process_state_transition(&stuck, ProcessState::Running);

        let stats = sched.request_cross_process_gc(&requester, true);

        assert_eq!(stats.timed_out, 1, "the stuck thread is skipped, not fatal");
        assert_eq!(stats.quiesced, 0);
        assert_eq!(stats.heaps_scavenged, 1, "only the requester was collected");
        assert_eq!(stuck.state(), ProcessState::Running);
    }

    #[test]
    fn idle_heaps_are_scavenged_to_recycle_blocks() {
        let sched = mk_scheduler();
        let requester = sched.spawn_process(false).expect("spawn");
        let idler = sched.spawn_process(false).expect("spawn");
        {
            let mut heap = idler.heap.lock();
            for _ in 0..100 {
                heap.allocate_bytes_zeroed(1024).expect("allocate");
            }
        }
        let garbage_bytes = idler.heap.lock().used_bytes();
        assert!(garbage_bytes > 0);

        sched.scavenge_idle_processes(&requester);

        assert_eq!(
            idler.heap.lock().used_bytes(),
            0,
            "an idle heap full of garbage collapses"
        );
    }

    #[test]
    fn largest_heap_block_count_tracks_the_biggest_heap() {
        let sched = mk_scheduler();
        let small = sched.spawn_process(false).expect("spawn");
        let big = sched.spawn_process(false).expect("spawn");
        {
            let mut heap = big.heap.lock();
            for _ in 0..100 {
                heap.allocate_bytes_zeroed(1024).expect("allocate");
            }
        }
        assert!(sched.largest_heap_block_count() >= 3);
        assert_eq!(small.heap.lock().block_count(), 1);
    }

    #[test]
    fn removed_processes_return_their_blocks() {
        let sched = mk_scheduler();
        let process = sched.spawn_process(false).expect("spawn");
        {
            let mut heap = process.heap.lock();
            for _ in 0..100 {
                heap.allocate_bytes_zeroed(1024).expect("allocate");
            }
        }
        let free_before = sched.pool().free_blocks();
        sched.remove_process(&process);
        drop(process);
        assert!(
            sched.pool().free_blocks() > free_before,
            "terminated heap must hand its blocks back"
        );
    }
}
