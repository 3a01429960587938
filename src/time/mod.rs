//! Tick counting, the sleep facility, and the timer tick handler.

pub mod sleep;

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::{mlfqs, SchedPolicy};
use portable_atomic::{AtomicU64, Ordering};

/// Conventional timer frequency in ticks per second.
pub const TIMER_FREQ: u32 = 100;

/// Scheduling quantum: ticks a thread may run before a mandatory yield.
pub const TIME_SLICE: u32 = 4;

/// Global tick counter: the system's monotonic time source.
///
/// Incremented once per timer interrupt; every scheduling deadline in the
/// core is expressed in ticks of this counter.
pub struct TickCounter {
    ticks: AtomicU64,
    frequency: u32,
}

impl TickCounter {
    pub(crate) const fn new(frequency: u32) -> TickCounter {
        TickCounter {
            ticks: AtomicU64::new(0),
            frequency,
        }
    }

    pub(crate) fn increment(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Ticks elapsed since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Tick frequency in Hz.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }
}

impl<A: Arch + 'static> Kernel<A> {
    /// Ticks elapsed since boot.
    pub fn ticks(&self) -> u64 {
        self.tick_counter().ticks()
    }

    /// Block the current thread until at least `ticks` timer ticks from now.
    ///
    /// Returns immediately when `ticks` is zero or negative. The thread
    /// wakes on the first tick at or after its deadline; it is not
    /// guaranteed to be scheduled immediately upon waking.
    pub fn sleep(&self, ticks: i64) {
        assert!(self.is_started(), "sleep before start");
        assert!(!self.in_interrupt(), "sleep from interrupt context");
        if ticks <= 0 {
            return;
        }
        let wake_tick = self.ticks() + ticks as u64;
        let switch = self.with_core(|core| {
            let cur = core.current;
            assert!(Some(cur) != core.idle, "idle thread may not sleep");
            log::trace!("thread {} sleeping until tick {}", cur, wake_tick);
            let tcb = core.tcb_mut(cur);
            tcb.wake_tick = wake_tick;
            tcb.state = crate::thread::ThreadState::Blocked;
            core.sleepers.insert(wake_tick, cur);
            core.schedule()
        });
        self.finish_switch(switch);
    }

    /// Timer tick handler. Call once per timer interrupt.
    ///
    /// Runs in interrupt context: advances the tick counter, wakes due
    /// sleepers, drives the MLFQS recurrences, and accounts the running
    /// thread's quantum. If preemption is warranted it happens at the
    /// return edge of this function, mimicking a yield-on-interrupt-return,
    /// never inside the handler body itself.
    pub fn timer_tick(&self) {
        assert!(self.is_initialized(), "tick before init");
        let now = self.tick_counter().increment();
        self.set_in_interrupt(true);
        let policy = self.options().policy;
        let freq = self.tick_counter().frequency();
        let slice = self.options().time_slice;
        let mut should_yield = self.with_core(|core| {
            if Some(core.current) == core.idle {
                core.idle_ticks += 1;
            } else {
                core.kernel_ticks += 1;
            }

            while let Some(tid) = core.pop_due_sleeper(now) {
                log::trace!("waking thread {} at tick {}", tid, now);
                core.unblock_internal(tid);
            }

            if policy == SchedPolicy::Mlfqs {
                mlfqs::on_tick(core, now, freq);
            }

            core.slice_used += 1;
            let mut preempt = core.slice_used >= slice;
            if let Some(max_ready) = core.max_ready_effective() {
                if max_ready > core.tcb(core.current).effective_priority {
                    preempt = true;
                }
            }
            preempt
        });
        self.set_in_interrupt(false);
        if self.take_yield_pending() {
            should_yield = true;
        }
        if should_yield && self.is_started() {
            self.yield_now();
        }
    }
}
