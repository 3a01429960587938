//! The scheduler core: thread table, ready structure, and dispatch.
//!
//! All mutable scheduler state lives in [`Core`], which the kernel guards
//! with the interrupts-disabled critical section. Selection is a scan of the
//! ready structure for the maximum effective priority, FIFO among equals;
//! with at most a few dozen threads in a teaching kernel, the scan is
//! cheaper than maintaining a sorted structure across donation updates.

pub mod mlfqs;

use crate::arch::Arch;
use crate::errors::SpawnError;
use crate::fixed::Fixed;
use crate::sync::condvar::CondState;
use crate::sync::lock::LockState;
use crate::sync::semaphore::SemaState;
use crate::thread::{Tcb, ThreadState, Tid};
use crate::time::sleep::SleepQueue;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

/// Scheduling policy, latched at `init` and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Strict highest-priority-first dispatch with priority donation.
    #[default]
    Priority,
    /// Multilevel feedback queue: priorities recomputed from recent CPU
    /// usage and the load average. Donation is disabled.
    Mlfqs,
}

/// Scheduler counters since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    /// Live threads, including idle.
    pub total_threads: usize,
    /// Threads on the ready structure.
    pub ready_threads: usize,
    /// Blocked threads (waiting or sleeping).
    pub blocked_threads: usize,
    /// Ticks spent in the idle thread.
    pub idle_ticks: u64,
    /// Ticks spent in ordinary threads.
    pub kernel_ticks: u64,
    /// Completed dispatches to a different thread.
    pub context_switches: u64,
}

/// A pending context switch, performed after the core state is unlocked.
pub(crate) struct Switch<A: Arch + 'static> {
    pub(crate) prev: *mut A::Context,
    pub(crate) next: *const A::Context,
}

/// All mutable scheduler state.
///
/// The ready structure, the sleeper queue, every wait queue, and the MLFQS
/// globals live here so that one critical section covers them all; the
/// scheduler itself never takes a lock (that would recurse).
pub(crate) struct Core<A: Arch + 'static> {
    pub(crate) threads: BTreeMap<Tid, Box<Tcb<A>>>,
    pub(crate) ready: VecDeque<Tid>,
    pub(crate) sleepers: SleepQueue,
    /// The running thread. Holds a placeholder before `init` installs the
    /// main thread; public entry points are guarded by the initialized flag.
    pub(crate) current: Tid,
    pub(crate) idle: Option<Tid>,
    /// Dying threads awaiting reclamation by the next dispatch.
    pub(crate) zombies: Vec<Tid>,
    pub(crate) semas: BTreeMap<u32, SemaState>,
    pub(crate) locks: BTreeMap<u32, LockState>,
    pub(crate) conds: BTreeMap<u32, CondState>,
    next_object_id: u32,
    next_tid: u32,
    pub(crate) policy: SchedPolicy,
    pub(crate) load_avg: Fixed,
    /// Ticks the current thread has run in its present quantum.
    pub(crate) slice_used: u32,
    pub(crate) idle_ticks: u64,
    pub(crate) kernel_ticks: u64,
    pub(crate) context_switches: u64,
}

impl<A: Arch + 'static> Core<A> {
    pub(crate) fn new(policy: SchedPolicy) -> Core<A> {
        Core {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            sleepers: SleepQueue::new(),
            current: Tid::new(1),
            idle: None,
            zombies: Vec::new(),
            semas: BTreeMap::new(),
            locks: BTreeMap::new(),
            conds: BTreeMap::new(),
            next_object_id: 1,
            next_tid: 1,
            policy,
            load_avg: Fixed::ZERO,
            slice_used: 0,
            idle_ticks: 0,
            kernel_ticks: 0,
            context_switches: 0,
        }
    }

    pub(crate) fn tcb(&self, tid: Tid) -> &Tcb<A> {
        self.threads.get(&tid).expect("unknown thread id")
    }

    pub(crate) fn tcb_mut(&mut self, tid: Tid) -> &mut Tcb<A> {
        self.threads.get_mut(&tid).expect("unknown thread id")
    }

    /// Allocate the next thread id. Ids are monotonic and never reused
    /// within a boot session.
    pub(crate) fn alloc_tid(&mut self) -> Result<Tid, SpawnError> {
        let raw = self.next_tid;
        self.next_tid = raw.checked_add(1).ok_or(SpawnError::TooManyThreads)?;
        Ok(Tid::new(raw))
    }

    /// Allocate an id for a semaphore, lock, or condition variable.
    pub(crate) fn alloc_object_id(&mut self) -> u32 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }

    /// Move a blocked thread to the ready structure.
    ///
    /// Does not make a preemption decision; callers that wake a
    /// higher-priority thread decide for themselves whether to yield.
    pub(crate) fn unblock_internal(&mut self, tid: Tid) {
        let tcb = self.tcb_mut(tid);
        debug_assert_eq!(tcb.state, ThreadState::Blocked, "unblock of non-blocked thread");
        tcb.state = ThreadState::Ready;
        tcb.wake_tick = 0;
        self.ready.push_back(tid);
    }

    /// Select and remove the highest-effective-priority ready thread.
    ///
    /// Ties break FIFO: among equals, the thread enqueued earliest wins.
    pub(crate) fn pick_next_ready(&mut self) -> Option<Tid> {
        let mut best: Option<(usize, i32)> = None;
        for (index, tid) in self.ready.iter().enumerate() {
            let effective = self.tcb(*tid).effective_priority;
            let better = match best {
                Some((_, best_effective)) => effective > best_effective,
                None => true,
            };
            if better {
                best = Some((index, effective));
            }
        }
        let (index, _) = best?;
        self.ready.remove(index)
    }

    /// Highest effective priority among ready threads, if any.
    pub(crate) fn max_ready_effective(&self) -> Option<i32> {
        self.ready
            .iter()
            .map(|tid| self.tcb(*tid).effective_priority)
            .max()
    }

    /// Ready threads plus the running thread when it is not idle; the `N`
    /// of the load-average recurrence.
    pub(crate) fn ready_plus_running(&self) -> usize {
        self.ready.len() + usize::from(Some(self.current) != self.idle)
    }

    /// Pop the next sleeper whose deadline has passed, skipping stale heap
    /// entries left behind by threads woken through other paths.
    pub(crate) fn pop_due_sleeper(&mut self, now: u64) -> Option<Tid> {
        while let Some((deadline, tid)) = self.sleepers.pop_due(now) {
            match self.threads.get(&tid) {
                Some(t) if t.state == ThreadState::Blocked && t.wake_tick == deadline => {
                    return Some(tid);
                }
                _ => continue,
            }
        }
        None
    }

    /// Dispatch: pick the next thread and hand back the pending switch.
    ///
    /// Must be called with the core locked and with the current thread's
    /// status already changed away from `Running`. If the current thread is
    /// re-selected, nothing happens. Reclaims threads that died before the
    /// previous dispatch.
    pub(crate) fn schedule(&mut self) -> Option<Switch<A>> {
        let prev = self.current;
        debug_assert!(
            self.tcb(prev).state != ThreadState::Running,
            "schedule with current still running"
        );
        self.reap_zombies();
        let next = match self.pick_next_ready() {
            Some(tid) => tid,
            None => self.idle.expect("no runnable thread and no idle thread"),
        };
        self.slice_used = 0;
        if next == prev {
            self.tcb_mut(prev).state = ThreadState::Running;
            return None;
        }
        self.tcb(next).check_canary();
        self.tcb_mut(next).state = ThreadState::Running;
        self.current = next;
        self.context_switches += 1;
        log::trace!("dispatch {} -> {}", prev, next);
        let prev_ptr = &mut self.threads.get_mut(&prev).expect("unknown thread id").context
            as *mut A::Context;
        let next_ptr =
            &self.threads.get(&next).expect("unknown thread id").context as *const A::Context;
        Some(Switch {
            prev: prev_ptr,
            next: next_ptr,
        })
    }

    /// Free threads that died before the previous dispatch. The thread that
    /// is switching out right now is kept until the following pass; its
    /// stack and context are still in use.
    fn reap_zombies(&mut self) {
        let current = self.current;
        let threads = &mut self.threads;
        self.zombies.retain(|tid| {
            if *tid == current {
                return true;
            }
            log::trace!("reaping thread {}", tid);
            threads.remove(tid);
            false
        });
    }
}
