//! Stub architecture for host testing and port bring-up.
//!
//! No actual context switching occurs: `context_switch` records that a
//! switch was requested and returns. The scheduling core still tracks which
//! thread is logically current, so every dispatch decision remains
//! observable from the host.

use super::Arch;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);
static SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);

/// Saved thread context (stub version).
#[derive(Debug, Default)]
pub struct StubContext {
    /// Program counter the thread would resume at
    pub pc: usize,
    /// Stack pointer the thread would resume with
    pub sp: usize,
}

/// Architecture implementation that performs no real switching.
pub struct StubArch;

impl StubArch {
    /// Number of context switches requested so far.
    pub fn switch_count() -> u64 {
        SWITCH_COUNT.load(Ordering::Acquire)
    }
}

impl Arch for StubArch {
    type Context = StubContext;

    fn init_context(ctx: &mut Self::Context, entry: usize, stack_top: usize) {
        ctx.pc = entry;
        ctx.sp = stack_top;
    }

    unsafe fn context_switch(_prev: *mut Self::Context, _next: *const Self::Context) {
        SWITCH_COUNT.fetch_add(1, Ordering::AcqRel);
    }

    fn enable_interrupts() {
        INTERRUPTS_ENABLED.store(true, Ordering::Release);
    }

    fn disable_interrupts() {
        INTERRUPTS_ENABLED.store(false, Ordering::Release);
    }

    fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.load(Ordering::Acquire)
    }
}
