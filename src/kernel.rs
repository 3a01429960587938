//! The kernel facade: thread lifecycle, preemption, and introspection.
//!
//! A [`Kernel`] owns all scheduler state behind one critical section and is
//! the only way to reach it. Threads, semaphores, locks, and condition
//! variables are created from it and borrow it. The boot sequence is
//! `new` -> `init` (installs the caller as the main thread) -> `start`
//! (creates the idle thread and enables interrupts); the embedding kernel
//! then wires its timer interrupt to [`Kernel::timer_tick`].

use crate::arch::Arch;
use crate::errors::{InitError, SchedError, SpawnError};
use crate::sched::{mlfqs, Core, SchedPolicy, SchedStats, Switch};
use crate::sync::lock::refresh_effective;
use crate::thread::{
    StackPage, Tcb, ThreadName, ThreadState, Tid, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX,
    PRI_MIN,
};
use crate::time::{TickCounter, TIMER_FREQ, TIME_SLICE};
use alloc::boxed::Box;
use alloc::vec::Vec;
use portable_atomic::{AtomicBool, AtomicPtr, Ordering};

static GLOBAL_KERNEL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Boot-time configuration, latched at `init` and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOptions {
    /// Scheduling policy; the default is priority scheduling with donation.
    pub policy: SchedPolicy,
    /// Timer ticks per second.
    pub timer_freq: u32,
    /// Ticks a thread may run before a mandatory yield.
    pub time_slice: u32,
}

impl Default for KernelOptions {
    fn default() -> KernelOptions {
        KernelOptions {
            policy: SchedPolicy::default(),
            timer_freq: TIMER_FREQ,
            time_slice: TIME_SLICE,
        }
    }
}

impl KernelOptions {
    /// Parse the kernel command line, recognizing the `-mlfqs` flag.
    pub fn from_boot_args(args: &str) -> KernelOptions {
        let mut options = KernelOptions::default();
        if args
            .split_whitespace()
            .any(|token| token == "-mlfqs" || token == "mlfqs")
        {
            options.policy = SchedPolicy::Mlfqs;
        }
        options
    }
}

/// The scheduling core.
pub struct Kernel<A: Arch + 'static> {
    options: KernelOptions,
    state: spin::Mutex<Core<A>>,
    ticks: TickCounter,
    initialized: AtomicBool,
    started: AtomicBool,
    in_irq: AtomicBool,
    yield_pending: AtomicBool,
}

impl<A: Arch + 'static> Kernel<A> {
    /// Create a kernel with the given options. No threads exist until
    /// [`init`](Kernel::init) runs.
    pub fn new(options: KernelOptions) -> Kernel<A> {
        Kernel {
            options,
            state: spin::Mutex::new(Core::new(options.policy)),
            ticks: TickCounter::new(options.timer_freq),
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            in_irq: AtomicBool::new(false),
            yield_pending: AtomicBool::new(false),
        }
    }

    /// The latched boot options.
    pub fn options(&self) -> KernelOptions {
        self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the core is executing its tick handler right now.
    pub fn in_interrupt(&self) -> bool {
        self.in_irq.load(Ordering::Acquire)
    }

    /// Whether a preemption is pending for the next interrupt return.
    pub fn preemption_requested(&self) -> bool {
        self.yield_pending.load(Ordering::Acquire)
    }

    pub(crate) fn tick_counter(&self) -> &TickCounter {
        &self.ticks
    }

    pub(crate) fn set_in_interrupt(&self, value: bool) {
        self.in_irq.store(value, Ordering::Release);
    }

    pub(crate) fn take_yield_pending(&self) -> bool {
        self.yield_pending.swap(false, Ordering::AcqRel)
    }

    /// Enter the critical section: interrupts disabled, core state locked.
    ///
    /// Interrupt disabling is the sole mutual exclusion inside the core.
    /// Never nested.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core<A>) -> R) -> R {
        let was_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        let result = {
            let mut core = self.state.lock();
            f(&mut core)
        };
        if was_enabled {
            A::enable_interrupts();
        }
        result
    }

    /// Perform a context switch decided inside the critical section.
    ///
    /// Interrupts are disabled across the switch itself; the resumed thread
    /// restores its own interrupt state on its way out of the scheduler.
    pub(crate) fn finish_switch(&self, switch: Option<Switch<A>>) {
        if let Some(switch) = switch {
            let was_enabled = A::interrupts_enabled();
            A::disable_interrupts();
            unsafe { A::context_switch(switch.prev, switch.next) };
            if was_enabled {
                A::enable_interrupts();
            }
        }
    }

    /// After waking `woken`, yield to it if it outranks the current thread.
    /// From interrupt context the yield is deferred to the return edge.
    pub(crate) fn resolve_wakeup(&self, woken: Option<Tid>) {
        let Some(tid) = woken else {
            return;
        };
        let outranks = self.with_core(|core| {
            core.tcb(tid).effective_priority > core.tcb(core.current).effective_priority
        });
        if !outranks {
            return;
        }
        if self.in_interrupt() || !self.is_started() {
            self.yield_pending.store(true, Ordering::Release);
        } else {
            self.yield_now();
        }
    }

    /// Install the caller as the main thread. Returns its tid.
    pub fn init(&self) -> Result<Tid, InitError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InitError::AlreadyInitialized);
        }
        let tid = self.with_core(|core| {
            let tid = core.alloc_tid().expect("tid space exhausted at init");
            let mut tcb = Tcb::<A>::new(tid, "main", PRI_DEFAULT, None);
            tcb.state = ThreadState::Running;
            core.threads.insert(tid, Box::new(tcb));
            core.current = tid;
            tid
        });
        log::debug!("scheduling core initialized, main thread {}", tid);
        Ok(tid)
    }

    /// Create the idle thread and enable interrupts. Returns the idle tid.
    pub fn start(&self) -> Result<Tid, SchedError> {
        if !self.is_initialized() {
            return Err(InitError::NotInitialized.into());
        }
        if self.is_started() {
            return Err(InitError::AlreadyStarted.into());
        }
        let stack = StackPage::alloc().map_err(SchedError::Spawn)?;
        let tid = self.with_core(|core| -> Result<Tid, SpawnError> {
            let tid = core.alloc_tid()?;
            let mut tcb = Tcb::<A>::new(tid, "idle", PRI_MIN, Some(stack));
            A::init_context(
                &mut tcb.context,
                trampoline_addr::<A>(),
                tcb.stack.as_ref().expect("idle stack missing").top(),
            );
            tcb.entry = Some(Box::new(|| loop {
                core::hint::spin_loop();
            }));
            // Parked: the idle thread is never on the ready structure and
            // runs only when nothing else is runnable.
            tcb.state = ThreadState::Blocked;
            core.threads.insert(tid, Box::new(tcb));
            core.idle = Some(tid);
            Ok(tid)
        })?;
        self.started.store(true, Ordering::Release);
        A::enable_interrupts();
        log::debug!("scheduling core started, idle thread {}", tid);
        Ok(tid)
    }

    /// Spawn a thread. It starts blocked, is immediately made ready, and
    /// preempts the caller at once when it has the higher effective
    /// priority.
    pub fn spawn<F>(&self, name: &str, priority: i32, entry: F) -> Result<Tid, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_initialized() {
            return Err(SpawnError::NotInitialized);
        }
        if !(PRI_MIN..=PRI_MAX).contains(&priority) {
            return Err(SpawnError::InvalidPriority(priority));
        }
        let stack = StackPage::alloc()?;
        let (tid, should_yield) = self.with_core(|core| -> Result<(Tid, bool), SpawnError> {
            let tid = core.alloc_tid()?;
            let mut tcb = Tcb::<A>::new(tid, name, priority, Some(stack));
            // MLFQS state is inherited from the creating thread.
            let parent = core.current;
            if let Some(parent_tcb) = core.threads.get(&parent) {
                tcb.nice = parent_tcb.nice;
                tcb.recent_cpu = parent_tcb.recent_cpu;
            }
            A::init_context(
                &mut tcb.context,
                trampoline_addr::<A>(),
                tcb.stack.as_ref().expect("spawned stack missing").top(),
            );
            tcb.entry = Some(Box::new(entry));
            core.threads.insert(tid, Box::new(tcb));
            core.unblock_internal(tid);
            log::trace!(
                "created thread {} '{}' with priority {}",
                tid,
                core.tcb(tid).name.as_str(),
                priority
            );
            let should_yield =
                core.tcb(tid).effective_priority > core.tcb(core.current).effective_priority;
            Ok((tid, should_yield))
        })?;
        if should_yield {
            if self.is_started() && !self.in_interrupt() {
                self.yield_now();
            } else {
                self.yield_pending.store(true, Ordering::Release);
            }
        }
        Ok(tid)
    }

    /// Give up the CPU. The caller stays runnable and is rescheduled when
    /// it is again the highest-priority ready thread.
    pub fn yield_now(&self) {
        assert!(self.is_started(), "yield before start");
        assert!(!self.in_interrupt(), "yield from interrupt context");
        let switch = self.with_core(|core| {
            let cur = core.current;
            if Some(cur) == core.idle {
                core.tcb_mut(cur).state = ThreadState::Blocked;
            } else {
                core.tcb_mut(cur).state = ThreadState::Ready;
                core.ready.push_back(cur);
            }
            core.schedule()
        });
        self.finish_switch(switch);
    }

    /// Block the current thread until [`unblock`](Kernel::unblock).
    pub fn block_current(&self) {
        assert!(self.is_started(), "block before start");
        assert!(!self.in_interrupt(), "block from interrupt context");
        let switch = self.with_core(|core| {
            let cur = core.current;
            assert!(Some(cur) != core.idle, "idle thread may not block");
            core.tcb_mut(cur).state = ThreadState::Blocked;
            core.schedule()
        });
        self.finish_switch(switch);
    }

    /// Make a blocked thread ready.
    ///
    /// Does not preempt the caller directly; if the woken thread outranks
    /// the running thread, preemption is requested for the next safe
    /// boundary. Panics if the thread is not blocked.
    pub fn unblock(&self, tid: Tid) {
        assert!(self.is_initialized(), "unblock before init");
        let outranks = self.with_core(|core| {
            assert!(Some(tid) != core.idle, "the idle thread is not unblockable");
            assert_eq!(
                core.tcb(tid).state,
                ThreadState::Blocked,
                "unblock of a thread that is not blocked"
            );
            core.unblock_internal(tid);
            core.tcb(tid).effective_priority > core.tcb(core.current).effective_priority
        });
        if outranks {
            self.yield_pending.store(true, Ordering::Release);
        }
    }

    /// Exit the current thread.
    ///
    /// On a real port the final context switch never returns; under the
    /// stub architecture control returns to the host driver, which
    /// continues as the newly dispatched thread. The dead thread's page is
    /// reclaimed by a later dispatch.
    pub fn exit_current(&self) {
        assert!(self.is_started(), "exit before start");
        assert!(!self.in_interrupt(), "exit from interrupt context");
        let switch = self.with_core(|core| {
            let cur = core.current;
            assert!(Some(cur) != core.idle, "idle thread may not exit");
            log::trace!("thread {} exiting", cur);
            core.tcb_mut(cur).state = ThreadState::Dying;
            core.zombies.push(cur);
            core.schedule()
        });
        self.finish_switch(switch);
    }

    fn take_current_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.with_core(|core| {
            let cur = core.current;
            core.tcb_mut(cur).entry.take()
        })
    }

    /// The running thread's tid. Also verifies its stack canary.
    pub fn current(&self) -> Tid {
        assert!(self.is_initialized(), "no current thread before init");
        self.with_core(|core| {
            let cur = core.current;
            core.tcb(cur).check_canary();
            cur
        })
    }

    /// The running thread's name.
    pub fn current_name(&self) -> ThreadName {
        self.with_core(|core| core.tcb(core.current).name.clone())
    }

    /// The running thread's effective priority.
    pub fn priority(&self) -> i32 {
        self.with_core(|core| core.tcb(core.current).effective_priority)
    }

    /// Set the running thread's base priority, clamped to the valid range.
    ///
    /// The effective priority is recomputed (it can drop only as far as
    /// remaining donations allow), and the caller yields when it is no
    /// longer the highest-priority runnable thread. A no-op under MLFQS.
    pub fn set_priority(&self, priority: i32) {
        assert!(self.is_initialized(), "set_priority before init");
        if self.options.policy == SchedPolicy::Mlfqs {
            return;
        }
        let priority = priority.clamp(PRI_MIN, PRI_MAX);
        let should_yield = self.with_core(|core| {
            let cur = core.current;
            core.tcb_mut(cur).base_priority = priority;
            refresh_effective(core, cur);
            match core.max_ready_effective() {
                Some(max_ready) => max_ready > core.tcb(cur).effective_priority,
                None => false,
            }
        });
        if should_yield && self.is_started() && !self.in_interrupt() {
            self.yield_now();
        }
    }

    /// The running thread's niceness.
    pub fn nice(&self) -> i32 {
        self.with_core(|core| core.tcb(core.current).nice)
    }

    /// Set the running thread's niceness, clamped to `[-20, 20]`.
    ///
    /// Under MLFQS the thread's priority is recomputed immediately and the
    /// caller yields when it is no longer the highest-priority runnable
    /// thread.
    pub fn set_nice(&self, nice: i32) {
        assert!(self.is_initialized(), "set_nice before init");
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        let should_yield = self.with_core(|core| {
            let cur = core.current;
            core.tcb_mut(cur).nice = nice;
            if core.policy == SchedPolicy::Mlfqs {
                let priority = mlfqs::priority_for(core.tcb(cur).recent_cpu, nice);
                let tcb = core.tcb_mut(cur);
                tcb.base_priority = priority;
                tcb.effective_priority = priority;
            }
            match core.max_ready_effective() {
                Some(max_ready) => max_ready > core.tcb(cur).effective_priority,
                None => false,
            }
        });
        if should_yield && self.is_started() && !self.in_interrupt() {
            self.yield_now();
        }
    }

    /// 100 times the running thread's recent CPU, rounded to nearest.
    pub fn recent_cpu_x100(&self) -> i32 {
        self.with_core(|core| {
            core.tcb(core.current)
                .recent_cpu
                .mul_int(100)
                .to_int_round()
        })
    }

    /// 100 times the system load average, rounded to nearest.
    pub fn load_avg_x100(&self) -> i32 {
        self.with_core(|core| core.load_avg.mul_int(100).to_int_round())
    }

    /// A thread's lifecycle state, or `None` once it has been reclaimed.
    pub fn state_of(&self, tid: Tid) -> Option<ThreadState> {
        self.with_core(|core| core.threads.get(&tid).map(|tcb| tcb.state))
    }

    /// A thread's effective priority.
    pub fn priority_of(&self, tid: Tid) -> Option<i32> {
        self.with_core(|core| core.threads.get(&tid).map(|tcb| tcb.effective_priority))
    }

    /// A thread's base priority.
    pub fn base_priority_of(&self, tid: Tid) -> Option<i32> {
        self.with_core(|core| core.threads.get(&tid).map(|tcb| tcb.base_priority))
    }

    /// A thread's name.
    pub fn name_of(&self, tid: Tid) -> Option<ThreadName> {
        self.with_core(|core| core.threads.get(&tid).map(|tcb| tcb.name.clone()))
    }

    /// The idle thread's tid, once started.
    pub fn idle_tid(&self) -> Option<Tid> {
        self.with_core(|core| core.idle)
    }

    /// All live thread ids, in creation order.
    pub fn threads(&self) -> Vec<Tid> {
        self.with_core(|core| core.threads.keys().copied().collect())
    }

    /// Scheduler counters since boot.
    pub fn stats(&self) -> SchedStats {
        self.with_core(|core| SchedStats {
            total_threads: core.threads.len(),
            ready_threads: core.ready.len(),
            blocked_threads: core
                .threads
                .values()
                .filter(|tcb| tcb.state == ThreadState::Blocked)
                .count(),
            idle_ticks: core.idle_ticks,
            kernel_ticks: core.kernel_ticks,
            context_switches: core.context_switches,
        })
    }

    /// Log the scheduler counters at info level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "{} ticks total: {} kernel, {} idle; {} context switches, {} threads",
            self.ticks(),
            stats.kernel_ticks,
            stats.idle_ticks,
            stats.context_switches,
            stats.total_threads
        );
    }

    /// Register this kernel as the process-wide instance used by spawned
    /// threads' entry trampolines.
    ///
    /// # Safety
    ///
    /// At most one kernel, of one architecture type, may ever be
    /// registered; the pointer is stored type-erased.
    pub unsafe fn register_global(&'static self) {
        GLOBAL_KERNEL.store(self as *const Kernel<A> as *mut (), Ordering::Release);
    }

    /// The registered kernel, if any.
    pub fn global() -> Option<&'static Kernel<A>> {
        let ptr = GLOBAL_KERNEL.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*(ptr as *const Kernel<A>) })
        }
    }
}

/// First code run by every spawned thread: invoke the stored entry closure,
/// then exit. The trailing loop is unreachable on a real port (the dying
/// thread is never resumed) and unused under the stub.
fn thread_trampoline<A: Arch + 'static>() {
    let kernel = Kernel::<A>::global().expect("no kernel registered for spawned threads");
    if let Some(entry) = kernel.take_current_entry() {
        entry();
    }
    kernel.exit_current();
    loop {
        core::hint::spin_loop();
    }
}

fn trampoline_addr<A: Arch + 'static>() -> usize {
    let f: fn() = thread_trampoline::<A>;
    f as usize
}
