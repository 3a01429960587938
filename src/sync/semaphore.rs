//! Counting semaphore with a priority-aware wait queue.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::Core;
use crate::thread::{Tcb, ThreadState, Tid};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};

/// Wait-queue state shared by semaphores and the semaphore inside each lock.
///
/// The queue is kept in arrival order; priority is consulted at wake time by
/// scanning for the maximum effective priority, so donations received while
/// a thread waits are honored without re-sorting.
pub(crate) struct SemaState {
    pub(crate) value: u32,
    pub(crate) waiters: VecDeque<Tid>,
}

impl SemaState {
    pub(crate) fn new(value: u32) -> SemaState {
        SemaState {
            value,
            waiters: VecDeque::new(),
        }
    }
}

/// Index of the waiter with the highest effective priority, FIFO among
/// equals (the earliest arrival wins).
pub(crate) fn pick_max_waiter<A: Arch + 'static>(
    waiters: &VecDeque<Tid>,
    threads: &BTreeMap<Tid, Box<Tcb<A>>>,
) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (index, tid) in waiters.iter().enumerate() {
        let effective = threads
            .get(tid)
            .expect("unknown thread id")
            .effective_priority;
        let better = match best {
            Some((_, best_effective)) => effective > best_effective,
            None => true,
        };
        if better {
            best = Some((index, effective));
        }
    }
    best.map(|(index, _)| index)
}

/// The up operation on a raw wait-queue state.
///
/// When a waiter exists the count is handed to it directly instead of
/// passing through the counter, so a woken thread owns its decrement the
/// moment it leaves the queue. Returns the woken thread, if any.
pub(crate) fn sema_up_inner<A: Arch + 'static>(core: &mut Core<A>, id: u32) -> Option<Tid> {
    let index = {
        let state = core.semas.get(&id).expect("semaphore destroyed");
        pick_max_waiter(&state.waiters, &core.threads)
    };
    match index {
        Some(index) => {
            let tid = core
                .semas
                .get_mut(&id)
                .expect("semaphore destroyed")
                .waiters
                .remove(index)
                .expect("waiter index out of range");
            core.unblock_internal(tid);
            Some(tid)
        }
        None => {
            core.semas.get_mut(&id).expect("semaphore destroyed").value += 1;
            None
        }
    }
}

/// A counting semaphore.
///
/// `down` blocks the calling thread while the count is zero; `up` wakes the
/// highest-priority waiter and yields to it when it outranks the caller.
pub struct Semaphore<'k, A: Arch + 'static> {
    pub(crate) kernel: &'k Kernel<A>,
    pub(crate) id: u32,
}

impl<A: Arch + 'static> Kernel<A> {
    /// Create a semaphore with the given initial count.
    pub fn semaphore(&self, initial: u32) -> Semaphore<'_, A> {
        let id = self.with_core(|core| {
            let id = core.alloc_object_id();
            core.semas.insert(id, SemaState::new(initial));
            id
        });
        Semaphore { kernel: self, id }
    }
}

impl<A: Arch + 'static> Semaphore<'_, A> {
    /// Decrement the count, blocking until it is positive.
    pub fn down(&self) {
        let kernel = self.kernel;
        assert!(
            !kernel.in_interrupt(),
            "semaphore down from interrupt context"
        );
        let switch = kernel.with_core(|core| {
            {
                let state = core.semas.get_mut(&self.id).expect("semaphore destroyed");
                if state.value > 0 {
                    state.value -= 1;
                    return None;
                }
                let cur = core.current;
                state.waiters.push_back(cur);
            }
            let cur = core.current;
            assert!(Some(cur) != core.idle, "idle thread may not block");
            core.tcb_mut(cur).state = ThreadState::Blocked;
            core.schedule()
        });
        kernel.finish_switch(switch);
        // If we blocked, `up` handed us the count before waking us.
    }

    /// Decrement the count without blocking.
    ///
    /// Returns `true` if the count was positive and was taken.
    pub fn try_down(&self) -> bool {
        self.kernel.with_core(|core| {
            let state = core.semas.get_mut(&self.id).expect("semaphore destroyed");
            if state.value > 0 {
                state.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Increment the count, waking the highest-priority waiter if any.
    ///
    /// Safe to call from interrupt context; the preemption it may warrant is
    /// deferred to the interrupt's return edge.
    pub fn up(&self) {
        let woken = self.kernel.with_core(|core| sema_up_inner(core, self.id));
        self.kernel.resolve_wakeup(woken);
    }

    /// Current count.
    pub fn value(&self) -> u32 {
        self.kernel
            .with_core(|core| core.semas.get(&self.id).expect("semaphore destroyed").value)
    }

    /// Number of blocked waiters.
    pub fn waiter_count(&self) -> usize {
        self.kernel.with_core(|core| {
            core.semas
                .get(&self.id)
                .expect("semaphore destroyed")
                .waiters
                .len()
        })
    }
}

impl<A: Arch + 'static> Drop for Semaphore<'_, A> {
    fn drop(&mut self) {
        self.kernel.with_core(|core| {
            if let Some(state) = core.semas.remove(&self.id) {
                if !state.waiters.is_empty() {
                    log::warn!("semaphore destroyed with {} waiters", state.waiters.len());
                }
            }
        });
    }
}
