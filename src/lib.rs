#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Priority scheduling core for single-CPU teaching kernels.
//!
//! This library is the thread-scheduling subsystem of a small kernel: it
//! decides which thread runs, when it yields, how blocked threads are
//! awoken, and how priorities are computed. Three behaviors form one
//! engine:
//!
//! - strict highest-priority-first dispatch (FIFO among equals),
//! - priority donation through lock chains, bounding priority inversion,
//! - an optional multilevel feedback queue mode (MLFQS) that recomputes
//!   priorities from recent CPU usage and a load average in fixed-point
//!   arithmetic.
//!
//! Also included: the timer-driven sleep facility and the per-tick
//! preemption decision. The machine itself (context-switch assembly,
//! interrupt controller, timer hardware) stays outside, reached through the
//! [`Arch`] trait; [`StubArch`] performs no real switching and lets the
//! whole engine run deterministically on a host.
//!
//! # Quick Start
//!
//! ```ignore
//! use sched_core::{Kernel, KernelOptions, DefaultArch};
//! use spin::Lazy;
//!
//! static KERNEL: Lazy<Kernel<DefaultArch>> =
//!     Lazy::new(|| Kernel::new(KernelOptions::from_boot_args(boot_args())));
//!
//! fn kernel_main() {
//!     KERNEL.init().expect("failed to initialize scheduling core");
//!     unsafe { KERNEL.register_global() };
//!     KERNEL.start().expect("failed to start scheduling core");
//!
//!     KERNEL.spawn("worker", 40, || {
//!         // thread work
//!     }).expect("failed to spawn thread");
//! }
//!
//! // from the timer interrupt handler:
//! fn on_timer_interrupt() {
//!     KERNEL.timer_tick();
//! }
//! ```

// Core modules
pub mod arch;
pub mod errors;
pub mod fixed;
pub mod kernel;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(test)]
mod tests;

#[cfg(test)]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    // On panic, spin; the embedding kernel owns the real halt path.
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, DefaultArch, StubArch};

// Kernel
pub use kernel::{Kernel, KernelOptions};

// Scheduler
pub use sched::{SchedPolicy, SchedStats};

// Threads
pub use thread::{
    ThreadName, ThreadState, Tid, NICE_DEFAULT, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN,
};

// Synchronization
pub use sync::{Condvar, Lock, Semaphore};

// Fixed-point arithmetic
pub use fixed::Fixed;

// Errors
pub use errors::{InitError, SchedError, SchedResult, SpawnError};

// Time
pub use time::{TickCounter, TIMER_FREQ, TIME_SLICE};

// ============================================================================
// Convenience Functions
// ============================================================================

/// Yield the current thread's time slice on the registered global kernel.
///
/// This is a cooperative yield: the thread stays runnable and is scheduled
/// again when it is the highest-priority ready thread. Does nothing when no
/// kernel has been registered.
#[inline]
pub fn yield_now<A: Arch + 'static>() {
    if let Some(kernel) = Kernel::<A>::global() {
        kernel.yield_now();
    }
}
