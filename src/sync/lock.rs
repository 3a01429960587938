//! Mutual-exclusion lock with priority donation.
//!
//! A lock is a holder field around a binary semaphore. Under the priority
//! policy a contended acquire donates the waiter's effective priority along
//! the chain of holders, and a release recomputes the holder's effective
//! priority from scratch: donation is not monotone, so the value can drop
//! below an earlier high-water mark once the donors are gone.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::{Core, SchedPolicy};
use crate::sync::semaphore::{pick_max_waiter, SemaState};
use crate::thread::{ThreadState, Tid};
use alloc::vec::Vec;

/// Upper bound on the donation chain walk. Correctness does not require
/// truncation (the walk also stops on a revisited thread); the bound caps
/// the cost of pathological chains.
pub const DONATION_DEPTH_MAX: usize = 8;

pub(crate) struct LockState {
    pub(crate) holder: Option<Tid>,
    pub(crate) inner: SemaState,
}

impl LockState {
    pub(crate) fn new() -> LockState {
        LockState {
            holder: None,
            inner: SemaState::new(1),
        }
    }
}

/// Hand the lock to `tid`: the inner count stays consumed and the thread's
/// donation bookkeeping is updated.
pub(crate) fn grant<A: Arch + 'static>(core: &mut Core<A>, lock_id: u32, tid: Tid) {
    {
        let state = core.locks.get_mut(&lock_id).expect("lock destroyed");
        debug_assert!(state.holder.is_none(), "grant of a held lock");
        state.holder = Some(tid);
        state.inner.value = 0;
    }
    let tcb = core.tcb_mut(tid);
    tcb.waiting_on = None;
    tcb.held_locks.push(lock_id);
}

/// Walk the chain `donor -> lock -> holder -> holder's lock -> ...`,
/// raising each visited holder's effective priority to at least the
/// donor's. Stops at a missing link, a revisited thread, or the depth
/// bound.
pub(crate) fn donate_chain<A: Arch + 'static>(core: &mut Core<A>, donor: Tid) {
    let donor_effective = core.tcb(donor).effective_priority;
    let mut visited: Vec<Tid> = Vec::new();
    visited.push(donor);
    let mut link = core.tcb(donor).waiting_on;
    let mut depth = 0;
    while let Some(lock_id) = link {
        if depth == DONATION_DEPTH_MAX {
            break;
        }
        let Some(holder) = core.locks.get(&lock_id).expect("lock destroyed").holder else {
            break;
        };
        if visited.contains(&holder) {
            break;
        }
        visited.push(holder);
        let tcb = core.tcb_mut(holder);
        if donor_effective > tcb.effective_priority {
            log::debug!(
                "thread {} donates priority {} to thread {}",
                donor,
                donor_effective,
                holder
            );
            tcb.effective_priority = donor_effective;
        }
        link = tcb.waiting_on;
        depth += 1;
    }
}

/// Recompute a thread's effective priority from its base and the waiters of
/// every lock it still holds.
pub(crate) fn refresh_effective<A: Arch + 'static>(core: &mut Core<A>, tid: Tid) {
    let mut effective = core.tcb(tid).base_priority;
    let held = core.tcb(tid).held_locks.clone();
    for lock_id in held {
        let state = core.locks.get(&lock_id).expect("lock destroyed");
        for waiter in &state.inner.waiters {
            let waiter_effective = core.tcb(*waiter).effective_priority;
            if waiter_effective > effective {
                effective = waiter_effective;
            }
        }
    }
    core.tcb_mut(tid).effective_priority = effective;
}

/// Acquire `lock_id` on behalf of a blocked thread (condition-variable wait
/// morphing). Takes the lock outright when free, otherwise joins its wait
/// queue and donates. Returns the thread if it became ready.
pub(crate) fn acquire_for<A: Arch + 'static>(core: &mut Core<A>, lock_id: u32, tid: Tid) -> Option<Tid> {
    let holder = core.locks.get(&lock_id).expect("lock destroyed").holder;
    match holder {
        None => {
            grant(core, lock_id, tid);
            core.unblock_internal(tid);
            Some(tid)
        }
        Some(_) => {
            core.tcb_mut(tid).waiting_on = Some(lock_id);
            if core.policy == SchedPolicy::Priority {
                donate_chain(core, tid);
            }
            core.locks
                .get_mut(&lock_id)
                .expect("lock destroyed")
                .inner
                .waiters
                .push_back(tid);
            None
        }
    }
}

/// Release `lock_id` held by `owner`: drop it from the held set, recompute
/// the owner's effective priority, and hand the lock to the
/// highest-priority waiter. Returns the new holder if one was woken.
pub(crate) fn release_for<A: Arch + 'static>(core: &mut Core<A>, lock_id: u32, owner: Tid) -> Option<Tid> {
    {
        let state = core.locks.get_mut(&lock_id).expect("lock destroyed");
        assert_eq!(state.holder, Some(owner), "lock released by non-holder");
        state.holder = None;
    }
    core.tcb_mut(owner).held_locks.retain(|id| *id != lock_id);
    if core.policy == SchedPolicy::Priority {
        refresh_effective(core, owner);
    }
    let index = {
        let state = core.locks.get(&lock_id).expect("lock destroyed");
        pick_max_waiter(&state.inner.waiters, &core.threads)
    };
    match index {
        Some(index) => {
            let tid = core
                .locks
                .get_mut(&lock_id)
                .expect("lock destroyed")
                .inner
                .waiters
                .remove(index)
                .expect("waiter index out of range");
            grant(core, lock_id, tid);
            if core.policy == SchedPolicy::Priority {
                // The new holder absorbs donations from the waiters left
                // behind on this lock.
                refresh_effective(core, tid);
            }
            core.unblock_internal(tid);
            Some(tid)
        }
        None => {
            core.locks
                .get_mut(&lock_id)
                .expect("lock destroyed")
                .inner
                .value = 1;
            None
        }
    }
}

/// A mutual-exclusion lock.
///
/// Not recursive: acquiring a lock already held by the caller panics, as
/// does releasing a lock the caller does not hold.
pub struct Lock<'k, A: Arch + 'static> {
    pub(crate) kernel: &'k Kernel<A>,
    pub(crate) id: u32,
}

impl<A: Arch + 'static> Kernel<A> {
    /// Create a lock.
    pub fn lock(&self) -> Lock<'_, A> {
        let id = self.with_core(|core| {
            let id = core.alloc_object_id();
            core.locks.insert(id, LockState::new());
            id
        });
        Lock { kernel: self, id }
    }
}

impl<A: Arch + 'static> Lock<'_, A> {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Acquire the lock, blocking until it is free.
    ///
    /// Under the priority policy a contended acquire donates the caller's
    /// effective priority along the holder chain before blocking.
    pub fn acquire(&self) {
        let kernel = self.kernel;
        assert!(!kernel.in_interrupt(), "lock acquire from interrupt context");
        let switch = kernel.with_core(|core| {
            let cur = core.current;
            let holder = core.locks.get(&self.id).expect("lock destroyed").holder;
            assert!(holder != Some(cur), "lock already held by current thread");
            match holder {
                None => {
                    grant(core, self.id, cur);
                    None
                }
                Some(holder) => {
                    log::trace!("thread {} waits on lock held by {}", cur, holder);
                    assert!(Some(cur) != core.idle, "idle thread may not block");
                    core.tcb_mut(cur).waiting_on = Some(self.id);
                    if core.policy == SchedPolicy::Priority {
                        donate_chain(core, cur);
                    }
                    core.locks
                        .get_mut(&self.id)
                        .expect("lock destroyed")
                        .inner
                        .waiters
                        .push_back(cur);
                    core.tcb_mut(cur).state = ThreadState::Blocked;
                    core.schedule()
                }
            }
        });
        kernel.finish_switch(switch);
        // If we blocked, release handed the lock to us before waking us.
    }

    /// Acquire the lock without blocking.
    ///
    /// Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        self.kernel.with_core(|core| {
            let cur = core.current;
            let holder = core.locks.get(&self.id).expect("lock destroyed").holder;
            assert!(holder != Some(cur), "lock already held by current thread");
            if holder.is_none() {
                grant(core, self.id, cur);
                true
            } else {
                false
            }
        })
    }

    /// Release the lock, handing it to the highest-priority waiter.
    ///
    /// The caller's effective priority is recomputed from its remaining
    /// locks; if it is no longer the highest runnable priority, the caller
    /// yields.
    pub fn release(&self) {
        let kernel = self.kernel;
        assert!(!kernel.in_interrupt(), "lock release from interrupt context");
        let should_yield = kernel.with_core(|core| {
            let cur = core.current;
            release_for(core, self.id, cur);
            match core.max_ready_effective() {
                Some(max_ready) => max_ready > core.tcb(cur).effective_priority,
                None => false,
            }
        });
        if should_yield {
            kernel.yield_now();
        }
    }

    /// The thread currently holding the lock, if any.
    pub fn holder(&self) -> Option<Tid> {
        self.kernel
            .with_core(|core| core.locks.get(&self.id).expect("lock destroyed").holder)
    }

    /// Whether the calling thread holds the lock.
    pub fn held_by_current(&self) -> bool {
        self.kernel.with_core(|core| {
            core.locks.get(&self.id).expect("lock destroyed").holder == Some(core.current)
        })
    }
}

impl<A: Arch + 'static> Drop for Lock<'_, A> {
    fn drop(&mut self) {
        self.kernel.with_core(|core| {
            let Some(state) = core.locks.remove(&self.id) else {
                return;
            };
            // Scrub the donation bookkeeping that referenced this lock.
            // Threads still waiting stay blocked indefinitely.
            if !state.inner.waiters.is_empty() {
                log::warn!("lock destroyed with {} waiters", state.inner.waiters.len());
            }
            for waiter in &state.inner.waiters {
                if let Some(tcb) = core.threads.get_mut(waiter) {
                    tcb.waiting_on = None;
                }
            }
            if let Some(holder) = state.holder {
                if let Some(tcb) = core.threads.get_mut(&holder) {
                    tcb.held_locks.retain(|id| *id != self.id);
                }
            }
        });
    }
}
