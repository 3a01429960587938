//! End-to-end scheduling scenarios driven through the public API.

use super::helpers::{assert_effective_at_least_base, boot, run_ticks, spawn_actor};
use crate::sched::SchedPolicy;
use crate::thread::{ThreadState, PRI_DEFAULT};

#[test]
fn test_donation_chain_on_one_lock() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let lock = kernel.lock();
    lock.acquire();

    // A waiter of priority 32 raises the holder to 32.
    let mid = spawn_actor(&kernel, "mid", 32);
    assert_eq!(kernel.current(), mid);
    lock.acquire(); // blocks, donates, dispatches back to main
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 32);

    // A second waiter of priority 33 raises it further.
    let high = spawn_actor(&kernel, "high", 33);
    assert_eq!(kernel.current(), high);
    lock.acquire();
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 33);
    assert_effective_at_least_base(&kernel);

    // Release: the donation lapses and the highest waiter takes the lock.
    lock.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(kernel.priority_of(main), Some(PRI_DEFAULT));
    assert!(lock.held_by_current());

    // The remaining waiter gets the lock on the next release, FIFO by
    // priority: mid is the only one left.
    lock.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(lock.holder(), Some(mid));
    assert_eq!(kernel.state_of(mid), Some(ThreadState::Ready));
}

#[test]
fn test_nested_donation_releases_are_not_monotone() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let lock_a = kernel.lock();
    let lock_b = kernel.lock();
    lock_a.acquire();
    lock_b.acquire();

    let mid = spawn_actor(&kernel, "mid", 32);
    assert_eq!(kernel.current(), mid);
    lock_a.acquire(); // mid waits on A
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 32);

    let high = spawn_actor(&kernel, "high", 33);
    assert_eq!(kernel.current(), high);
    lock_b.acquire(); // high waits on B
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 33);

    // Releasing A hands it to mid but the donation from high (on B) still
    // pins main at 33.
    lock_a.release();
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 33);
    assert_eq!(lock_a.holder(), Some(mid));

    // Releasing B drops main back to its base priority and the woken
    // high-priority thread preempts it.
    lock_b.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(kernel.priority_of(main), Some(PRI_DEFAULT));
}

#[test]
fn test_transitive_donation_through_a_holder_chain() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let lock_outer = kernel.lock();
    let lock_inner = kernel.lock();
    lock_outer.acquire(); // main holds the outer lock

    // A middle thread takes the inner lock, then waits on the outer one.
    let mid = spawn_actor(&kernel, "mid", 40);
    assert_eq!(kernel.current(), mid);
    lock_inner.acquire();
    lock_outer.acquire(); // blocks: mid -> outer -> main
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 40);

    // A high thread waits on the inner lock; the donation must flow
    // through mid to main.
    let high = spawn_actor(&kernel, "high", 45);
    assert_eq!(kernel.current(), high);
    lock_inner.acquire(); // blocks: high -> inner -> mid -> outer -> main
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority_of(mid), Some(45));
    assert_eq!(kernel.priority(), 45);
    assert_effective_at_least_base(&kernel);

    // Unwind: main releases the outer lock; mid (at 45) preempts, releases
    // the inner lock, and high finally runs.
    lock_outer.release();
    assert_eq!(kernel.current(), mid);
    assert_eq!(kernel.priority_of(main), Some(PRI_DEFAULT));
    lock_inner.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(kernel.priority_of(mid), Some(40));
    assert_effective_at_least_base(&kernel);
}

#[test]
fn test_lowering_priority_keeps_donated_floor() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let lock = kernel.lock();
    lock.acquire();

    let high = spawn_actor(&kernel, "high", 50);
    assert_eq!(kernel.current(), high);
    lock.acquire();
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority(), 50);

    // Lowering the base cannot drop below the active donation.
    kernel.set_priority(20);
    assert_eq!(kernel.base_priority_of(main), Some(20));
    assert_eq!(kernel.priority(), 50);

    lock.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(kernel.priority_of(main), Some(20));
}

#[test]
fn test_set_priority_yields_when_outranked() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let peer = spawn_actor(&kernel, "peer", PRI_DEFAULT);
    assert_eq!(kernel.current(), main);

    kernel.set_priority(10);
    assert_eq!(kernel.current(), peer);
    assert_eq!(kernel.priority_of(main), Some(10));
    assert_eq!(kernel.state_of(main), Some(ThreadState::Ready));
}

#[test]
fn test_spawn_of_higher_priority_preempts_creator() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    kernel.set_priority(20);

    let hi = spawn_actor(&kernel, "hi", 40);
    // The new thread runs before the creator resumes.
    assert_eq!(kernel.current(), hi);
    assert_eq!(kernel.state_of(main), Some(ThreadState::Ready));

    // When it exits, the creator resumes and the corpse is reaped by the
    // next dispatch.
    kernel.exit_current();
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.state_of(hi), Some(ThreadState::Dying));
    kernel.yield_now();
    assert_eq!(kernel.state_of(hi), None);
}

#[test]
fn test_equal_priorities_round_robin_on_the_time_slice() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let peer = spawn_actor(&kernel, "peer", PRI_DEFAULT);
    assert_eq!(kernel.current(), main);

    // Quantum is four ticks; neither thread starves.
    run_ticks(&kernel, 4);
    assert_eq!(kernel.current(), peer);
    run_ticks(&kernel, 4);
    assert_eq!(kernel.current(), main);
    run_ticks(&kernel, 4);
    assert_eq!(kernel.current(), peer);
}

#[test]
fn test_sleep_wakes_in_deadline_order() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();

    let slow = spawn_actor(&kernel, "slow", 40);
    kernel.sleep(30); // as `slow`, from tick 0
    assert_eq!(kernel.current(), main);

    let quick = spawn_actor(&kernel, "quick", 40);
    kernel.sleep(10); // as `quick`, from tick 0
    assert_eq!(kernel.current(), main);

    // Neither is scheduled before its deadline.
    run_ticks(&kernel, 9);
    assert_eq!(kernel.state_of(quick), Some(ThreadState::Blocked));
    assert_eq!(kernel.state_of(slow), Some(ThreadState::Blocked));

    // Tick 10: quick wakes and, outranking main, preempts it.
    kernel.timer_tick();
    assert_eq!(kernel.current(), quick);
    assert_eq!(kernel.state_of(slow), Some(ThreadState::Blocked));

    kernel.block_current(); // park quick again
    assert_eq!(kernel.current(), main);

    run_ticks(&kernel, 19);
    assert_eq!(kernel.state_of(slow), Some(ThreadState::Blocked));
    kernel.timer_tick(); // tick 30
    assert_eq!(kernel.current(), slow);
}

#[test]
fn test_semaphore_wakes_by_priority_fifo_among_ties() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let sema = kernel.semaphore(0);

    let low = spawn_actor(&kernel, "low", 40);
    sema.down(); // as low
    let first = spawn_actor(&kernel, "first", 50);
    sema.down(); // as first
    let second = spawn_actor(&kernel, "second", 50);
    sema.down(); // as second
    assert_eq!(kernel.current(), main);
    assert_eq!(sema.waiter_count(), 3);

    // Highest priority first; among the two at 50, FIFO.
    sema.up();
    assert_eq!(kernel.current(), first);
    kernel.block_current();
    sema.up();
    assert_eq!(kernel.current(), second);
    kernel.block_current();
    sema.up();
    assert_eq!(kernel.current(), low);

    // Every up was a direct handoff; the count never surfaced.
    assert_eq!(sema.value(), 0);
    assert_eq!(sema.waiter_count(), 0);
}

#[test]
fn test_condvar_signals_highest_priority_waiter() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let lock = kernel.lock();
    let cond = kernel.condvar();

    let low = spawn_actor(&kernel, "low", 40);
    lock.acquire();
    cond.wait(&lock); // as low; lock is free again afterwards
    assert_eq!(kernel.current(), main);

    let high = spawn_actor(&kernel, "high", 45);
    lock.acquire();
    cond.wait(&lock); // as high
    assert_eq!(kernel.current(), main);
    assert_eq!(cond.waiter_count(), 2);

    lock.acquire();
    cond.signal(&lock);
    // The signalled waiter morphs onto the lock and donates to the
    // signaller until the lock is released.
    assert_eq!(cond.waiter_count(), 1);
    assert_eq!(kernel.state_of(high), Some(ThreadState::Blocked));
    assert_eq!(kernel.priority(), 45);

    lock.release();
    assert_eq!(kernel.current(), high);
    assert!(lock.held_by_current());
    assert_eq!(kernel.priority_of(main), Some(PRI_DEFAULT));

    // The remaining waiter follows the same path from the new holder.
    cond.signal(&lock);
    lock.release();
    assert_eq!(kernel.current(), high);
    assert_eq!(lock.holder(), Some(low));
    assert_eq!(kernel.state_of(low), Some(ThreadState::Ready));
}

#[test]
fn test_condvar_broadcast_wakes_everyone() {
    let kernel = boot(SchedPolicy::Priority);
    let lock = kernel.lock();
    let cond = kernel.condvar();

    let a = spawn_actor(&kernel, "a", 40);
    lock.acquire();
    cond.wait(&lock);
    let b = spawn_actor(&kernel, "b", 35);
    lock.acquire();
    cond.wait(&lock);

    lock.acquire();
    cond.broadcast(&lock);
    assert_eq!(cond.waiter_count(), 0);
    assert_eq!(kernel.priority(), 40);

    lock.release();
    assert_eq!(kernel.current(), a);
    lock.release(); // as a
    assert_eq!(lock.holder(), Some(b));
}

#[test]
fn test_mlfqs_recomputes_priority_from_recent_cpu() {
    let kernel = boot(SchedPolicy::Mlfqs);
    // Four ticks charge the running thread four units of recent CPU and
    // land on a recomputation boundary: 63 - 4/4 - 0 = 62.
    run_ticks(&kernel, 4);
    assert_eq!(kernel.recent_cpu_x100(), 400);
    assert_eq!(kernel.priority(), 62);
    let main = kernel.current();
    assert_eq!(kernel.base_priority_of(main), kernel.priority_of(main));
}

#[test]
fn test_mlfqs_disables_donation_and_set_priority() {
    let kernel = boot(SchedPolicy::Mlfqs);
    let main = kernel.current();
    let lock = kernel.lock();
    lock.acquire();

    let high = spawn_actor(&kernel, "high", 50);
    assert_eq!(kernel.current(), high);
    lock.acquire(); // no donation happens
    assert_eq!(kernel.current(), main);
    assert_eq!(kernel.priority_of(main), Some(PRI_DEFAULT));

    kernel.set_priority(5); // no-op under MLFQS
    assert_eq!(kernel.priority(), PRI_DEFAULT);
}

#[test]
fn test_mlfqs_set_nice_recomputes_immediately() {
    let kernel = boot(SchedPolicy::Mlfqs);
    kernel.set_nice(10);
    assert_eq!(kernel.nice(), 10);
    // recent_cpu is still zero: 63 - 0 - 20 = 43.
    assert_eq!(kernel.priority(), 43);

    kernel.set_nice(-25); // clamped to -20
    assert_eq!(kernel.nice(), -20);
    assert_eq!(kernel.priority(), 63);
}

#[test]
fn test_unblock_defers_preemption_to_the_tick_boundary() {
    let kernel = boot(SchedPolicy::Priority);
    let main = kernel.current();
    let high = spawn_actor(&kernel, "high", 50);
    assert_eq!(kernel.current(), high);
    kernel.block_current();
    assert_eq!(kernel.current(), main);

    kernel.unblock(high);
    // Still running: the wakeup only requested preemption.
    assert_eq!(kernel.current(), main);
    assert!(kernel.preemption_requested());

    kernel.timer_tick();
    assert_eq!(kernel.current(), high);
    assert!(!kernel.preemption_requested());
}
