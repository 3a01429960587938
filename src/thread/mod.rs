//! Thread control blocks and the thread state machine.
//!
//! Each thread is identified by a [`Tid`] that is unique for the life of the
//! boot session (monotonically allocated, never reused). The control block
//! carries the four-state lifecycle, both priority views (base and
//! effective), the donation bookkeeping, the MLFQS accumulators, and the
//! thread's stack page.

use crate::arch::Arch;
use crate::errors::SpawnError;
use crate::fixed::Fixed;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::num::NonZeroU32;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Lowest niceness (least nice, most CPU-hungry).
pub const NICE_MIN: i32 = -20;
/// Default niceness.
pub const NICE_DEFAULT: i32 = 0;
/// Highest niceness.
pub const NICE_MAX: i32 = 20;

/// Maximum thread name length in bytes; longer names are truncated.
pub const NAME_MAX: usize = 15;

/// A thread's human-readable name.
pub type ThreadName = heapless::String<NAME_MAX>;

/// Thread identifier, unique for the lifetime of the boot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(NonZeroU32);

impl Tid {
    pub(crate) fn new(raw: u32) -> Tid {
        Tid(NonZeroU32::new(raw).expect("tid must be non-zero"))
    }

    /// Get the raw identifier value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States in a thread's life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Currently on the CPU. Exactly one thread is `Running` at any instant.
    Running,
    /// Runnable and on the ready structure.
    Ready,
    /// Waiting for an event: a semaphore, a lock, a condition variable, a
    /// sleep deadline, or an explicit `unblock`.
    Blocked,
    /// Exited; reaped by the next scheduler dispatch.
    Dying,
}

/// Size of the per-thread stack page.
pub const STACK_PAGE_SIZE: usize = 4096;

const STACK_CANARY: u32 = 0xbead_5ca7;

/// A page-sized kernel stack with an overflow canary at its base.
///
/// The stack grows down toward the canary; corruption of the canary word is
/// detected on the next `current()` query or dispatch and panics, since the
/// thread's saved state can no longer be trusted.
pub(crate) struct StackPage {
    mem: Box<[u8]>,
}

impl StackPage {
    pub(crate) fn alloc() -> Result<StackPage, SpawnError> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(STACK_PAGE_SIZE)
            .map_err(|_| SpawnError::OutOfMemory)?;
        mem.resize(STACK_PAGE_SIZE, 0);
        let mut page = StackPage {
            mem: mem.into_boxed_slice(),
        };
        page.mem[..4].copy_from_slice(&STACK_CANARY.to_le_bytes());
        Ok(page)
    }

    pub(crate) fn canary_intact(&self) -> bool {
        self.mem[..4] == STACK_CANARY.to_le_bytes()
    }

    /// Address one past the highest byte; the initial stack pointer.
    pub(crate) fn top(&self) -> usize {
        self.mem.as_ptr() as usize + self.mem.len()
    }
}

/// Thread control block.
///
/// Owned by the scheduler core's thread table; never handed out by
/// reference across the API boundary.
pub(crate) struct Tcb<A: Arch + 'static> {
    pub(crate) tid: Tid,
    pub(crate) name: ThreadName,
    pub(crate) state: ThreadState,
    /// Priority set by the user (or by the MLFQS engine).
    pub(crate) base_priority: i32,
    /// Priority the scheduler compares: max of base and received donations.
    pub(crate) effective_priority: i32,
    /// Tick at which a sleeping thread should wake; 0 when not sleeping.
    pub(crate) wake_tick: u64,
    /// Ids of locks currently held, for donation refresh on release.
    pub(crate) held_locks: Vec<u32>,
    /// Id of the lock whose semaphore this thread is blocked on, if any.
    pub(crate) waiting_on: Option<u32>,
    pub(crate) recent_cpu: Fixed,
    pub(crate) nice: i32,
    pub(crate) context: A::Context,
    /// `None` only for the main thread, which runs on the boot stack.
    pub(crate) stack: Option<StackPage>,
    pub(crate) entry: Option<Box<dyn FnOnce() + Send>>,
}

impl<A: Arch + 'static> Tcb<A> {
    pub(crate) fn new(tid: Tid, name: &str, priority: i32, stack: Option<StackPage>) -> Tcb<A> {
        let mut truncated = ThreadName::new();
        for ch in name.chars() {
            if truncated.push(ch).is_err() {
                break;
            }
        }
        Tcb {
            tid,
            name: truncated,
            state: ThreadState::Blocked,
            base_priority: priority,
            effective_priority: priority,
            wake_tick: 0,
            held_locks: Vec::new(),
            waiting_on: None,
            recent_cpu: Fixed::ZERO,
            nice: NICE_DEFAULT,
            context: A::Context::default(),
            stack,
            entry: None,
        }
    }

    /// Panic if the stack canary has been clobbered.
    pub(crate) fn check_canary(&self) {
        if let Some(stack) = &self.stack {
            assert!(
                stack.canary_intact(),
                "stack overflow detected in thread {} ({})",
                self.tid,
                self.name.as_str()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::StubArch;

    #[test]
    fn test_name_truncation() {
        let tcb: Tcb<StubArch> =
            Tcb::new(Tid::new(1), "a-name-that-is-far-too-long", PRI_DEFAULT, None);
        assert_eq!(tcb.name.as_str(), "a-name-that-is-");
        assert_eq!(tcb.name.len(), NAME_MAX);
    }

    #[test]
    fn test_canary_detects_overwrite() {
        let mut page = StackPage::alloc().unwrap();
        assert!(page.canary_intact());
        page.mem[0] ^= 0xff;
        assert!(!page.canary_intact());
    }

    #[test]
    fn test_new_tcb_is_blocked() {
        let tcb: Tcb<StubArch> = Tcb::new(Tid::new(7), "t", 10, None);
        assert_eq!(tcb.state, ThreadState::Blocked);
        assert_eq!(tcb.base_priority, tcb.effective_priority);
    }
}
