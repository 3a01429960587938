//! Shared fixtures for the scheduler test suite.

use crate::arch::StubArch;
use crate::kernel::{Kernel, KernelOptions};
use crate::sched::SchedPolicy;
use crate::thread::Tid;

/// A started kernel with the host test as its main thread.
pub(crate) fn boot(policy: SchedPolicy) -> Kernel<StubArch> {
    let kernel = Kernel::new(KernelOptions {
        policy,
        ..KernelOptions::default()
    });
    kernel.init().expect("init failed");
    kernel.start().expect("start failed");
    kernel
}

/// Spawn a thread that exists only as a schedulable control block; the
/// test script performs its actions whenever it is current.
pub(crate) fn spawn_actor(kernel: &Kernel<StubArch>, name: &str, priority: i32) -> Tid {
    kernel.spawn(name, priority, || {}).expect("spawn failed")
}

/// Drive `n` timer interrupts.
pub(crate) fn run_ticks(kernel: &Kernel<StubArch>, n: u64) {
    for _ in 0..n {
        kernel.timer_tick();
    }
}

/// Every live thread's effective priority is at least its base priority.
pub(crate) fn assert_effective_at_least_base(kernel: &Kernel<StubArch>) {
    for tid in kernel.threads() {
        let base = kernel.base_priority_of(tid).unwrap();
        let effective = kernel.priority_of(tid).unwrap();
        assert!(
            effective >= base,
            "thread {} has effective {} below base {}",
            tid,
            effective,
            base
        );
    }
}
