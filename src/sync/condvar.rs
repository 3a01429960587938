//! Condition variable.
//!
//! Waiters park individually; `signal` picks the waiter with the highest
//! effective priority at signal time and morphs it directly onto the
//! associated lock (taking the lock when free, otherwise joining its wait
//! queue and donating), so a signalled thread never becomes runnable only
//! to block again on the lock.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sync::lock::{acquire_for, release_for, Lock};
use crate::sync::semaphore::pick_max_waiter;
use crate::thread::{ThreadState, Tid};
use alloc::collections::VecDeque;

pub(crate) struct CondState {
    pub(crate) waiters: VecDeque<Tid>,
}

impl CondState {
    pub(crate) fn new() -> CondState {
        CondState {
            waiters: VecDeque::new(),
        }
    }
}

/// A condition variable, always used together with a [`Lock`].
pub struct Condvar<'k, A: Arch + 'static> {
    kernel: &'k Kernel<A>,
    id: u32,
}

impl<A: Arch + 'static> Kernel<A> {
    /// Create a condition variable.
    pub fn condvar(&self) -> Condvar<'_, A> {
        let id = self.with_core(|core| {
            let id = core.alloc_object_id();
            core.conds.insert(id, CondState::new());
            id
        });
        Condvar { kernel: self, id }
    }
}

impl<A: Arch + 'static> Condvar<'_, A> {
    /// Atomically release `lock` and block until signalled; the lock is
    /// held again when this returns.
    ///
    /// Panics if the caller does not hold `lock`.
    pub fn wait(&self, lock: &Lock<'_, A>) {
        let kernel = self.kernel;
        assert!(
            core::ptr::eq(kernel, lock.kernel),
            "condition variable and lock belong to different kernels"
        );
        assert!(!kernel.in_interrupt(), "condition wait from interrupt context");
        let switch = kernel.with_core(|core| {
            let cur = core.current;
            assert_eq!(
                core.locks.get(&lock.id()).expect("lock destroyed").holder,
                Some(cur),
                "condition wait without holding the lock"
            );
            assert!(Some(cur) != core.idle, "idle thread may not block");
            core.conds
                .get_mut(&self.id)
                .expect("condition variable destroyed")
                .waiters
                .push_back(cur);
            release_for(core, lock.id(), cur);
            core.tcb_mut(cur).state = ThreadState::Blocked;
            core.schedule()
        });
        kernel.finish_switch(switch);
        // The signaller reacquired the lock on our behalf before waking us.
    }

    /// Wake the highest-priority waiter, if any.
    ///
    /// Panics if the caller does not hold `lock`.
    pub fn signal(&self, lock: &Lock<'_, A>) {
        let kernel = self.kernel;
        let woken = kernel.with_core(|core| {
            let cur = core.current;
            assert_eq!(
                core.locks.get(&lock.id()).expect("lock destroyed").holder,
                Some(cur),
                "condition signal without holding the lock"
            );
            let index = {
                let state = core
                    .conds
                    .get(&self.id)
                    .expect("condition variable destroyed");
                pick_max_waiter(&state.waiters, &core.threads)
            };
            let index = index?;
            let tid = core
                .conds
                .get_mut(&self.id)
                .expect("condition variable destroyed")
                .waiters
                .remove(index)
                .expect("waiter index out of range");
            log::trace!("signalling thread {}", tid);
            acquire_for(core, lock.id(), tid)
        });
        kernel.resolve_wakeup(woken);
    }

    /// Wake every waiter.
    pub fn broadcast(&self, lock: &Lock<'_, A>) {
        loop {
            let empty = self.kernel.with_core(|core| {
                core.conds
                    .get(&self.id)
                    .expect("condition variable destroyed")
                    .waiters
                    .is_empty()
            });
            if empty {
                break;
            }
            self.signal(lock);
        }
    }

    /// Number of blocked waiters.
    pub fn waiter_count(&self) -> usize {
        self.kernel.with_core(|core| {
            core.conds
                .get(&self.id)
                .expect("condition variable destroyed")
                .waiters
                .len()
        })
    }
}

impl<A: Arch + 'static> Drop for Condvar<'_, A> {
    fn drop(&mut self) {
        self.kernel.with_core(|core| {
            if let Some(state) = core.conds.remove(&self.id) {
                if !state.waiters.is_empty() {
                    log::warn!(
                        "condition variable destroyed with {} waiters",
                        state.waiters.len()
                    );
                }
            }
        });
    }
}
