//! Multilevel feedback queue recurrences.
//!
//! All state is kept in signed Q15.16 fixed-point. Per tick the running
//! thread is charged one unit of recent CPU; every fourth tick all
//! priorities are recomputed; once per second the load average and every
//! thread's recent CPU decay. The idle thread is invisible to all of it: it
//! is never charged, never recomputed, and never counted in `N`.

use crate::arch::Arch;
use crate::fixed::Fixed;
use crate::sched::Core;
use crate::thread::{PRI_MAX, PRI_MIN};

/// Ticks between priority recomputations.
const PRIORITY_INTERVAL: u64 = 4;

/// Drive the recurrences for one timer tick.
pub(crate) fn on_tick<A: Arch + 'static>(core: &mut Core<A>, now: u64, timer_freq: u32) {
    if Some(core.current) != core.idle {
        let current = core.current;
        let tcb = core.tcb_mut(current);
        tcb.recent_cpu = tcb.recent_cpu.add_int(1);
    }
    if now % PRIORITY_INTERVAL == 0 {
        recompute_priorities(core);
    }
    if now % u64::from(timer_freq) == 0 {
        recompute_load_avg(core);
        decay_recent_cpu(core);
    }
}

/// `PRI_MAX - recent_cpu/4 - 2*nice`, clamped to the priority range.
pub(crate) fn priority_for(recent_cpu: Fixed, nice: i32) -> i32 {
    let raw = Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2);
    raw.to_int().clamp(PRI_MIN, PRI_MAX)
}

/// Recompute every thread's priority from its recent CPU and niceness.
///
/// The result lands in both the base and the effective priority: donation
/// is inactive under MLFQS. Ready-structure order needs no maintenance
/// since selection is by scan.
pub(crate) fn recompute_priorities<A: Arch + 'static>(core: &mut Core<A>) {
    let idle = core.idle;
    for (tid, tcb) in core.threads.iter_mut() {
        if Some(*tid) == idle {
            continue;
        }
        let priority = priority_for(tcb.recent_cpu, tcb.nice);
        tcb.base_priority = priority;
        tcb.effective_priority = priority;
    }
}

/// `load_avg = (59/60)*load_avg + (1/60)*N` where `N` counts ready threads
/// plus the running thread when it is not idle.
fn recompute_load_avg<A: Arch + 'static>(core: &mut Core<A>) {
    let n = core.ready_plus_running() as i32;
    let decay = Fixed::from_int(59).div_int(60);
    let weight = Fixed::from_int(1).div_int(60);
    core.load_avg = core.load_avg.mul(decay) + weight.mul_int(n);
    log::debug!(
        "load_avg now {} (x100), N = {}",
        core.load_avg.mul_int(100).to_int_round(),
        n
    );
}

/// `recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice` for
/// every thread, including blocked ones.
fn decay_recent_cpu<A: Arch + 'static>(core: &mut Core<A>) {
    let twice_load = core.load_avg.mul_int(2);
    let coefficient = twice_load.div(twice_load.add_int(1));
    let idle = core.idle;
    for (tid, tcb) in core.threads.iter_mut() {
        if Some(*tid) == idle {
            continue;
        }
        tcb.recent_cpu = coefficient.mul(tcb.recent_cpu).add_int(tcb.nice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_formula() {
        // recent_cpu = 60.0, nice = 0: 63 - 15 - 0 = 48.
        assert_eq!(priority_for(Fixed::from_int(60), 0), 48);
        // nice pulls priority down two points per unit.
        assert_eq!(priority_for(Fixed::from_int(60), 5), 38);
        // clamped at both ends.
        assert_eq!(priority_for(Fixed::from_int(4000), 20), PRI_MIN);
        assert_eq!(priority_for(Fixed::ZERO, -20), PRI_MAX);
    }
}
