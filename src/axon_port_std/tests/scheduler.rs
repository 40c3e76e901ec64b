//! Scheduler behavior: dispatch, preemption, round-robin, the scheduler
//! lock, and thread lifecycle transitions.
use axon_kernel::{error::InitThreadError, utils::Init, SemaphoreCb, ThreadCb, ThreadSt};

#[macro_use]
mod common;
use common::{current_is, idle_is_current, noop_entry, spawn};

kernel_test_env!(mod round_robin { levels: 16, quantum: 2 });

/// Two equal-priority threads with a quantum of 2 alternate every two ticks.
#[test]
fn round_robin_rotates_equal_priority() {
    use round_robin::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 5);
    axon_port_std::boot::<Sys>();

    assert!(current_is(&A));

    axon_port_std::tick::<Sys>();
    assert!(current_is(&A));
    axon_port_std::tick::<Sys>();
    assert!(current_is(&B));

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert!(current_is(&A));

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert!(current_is(&B));
}

kernel_test_env!(mod preempt { levels: 16, quantum: 0 });

/// A newly created thread of strictly higher priority preempts the running
/// thread before `thread_init` returns to the caller.
#[test]
fn new_higher_priority_thread_preempts() {
    use preempt::{Sys, System};
    static L: ThreadCb<Sys> = Init::INIT;
    static H: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&L, 1);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&L));

    spawn(&H, 10);
    assert!(current_is(&H));
    assert_eq!(System::thread_state(&L).unwrap(), ThreadSt::Ready);
}

kernel_test_env!(mod no_preempt { levels: 16, quantum: 0 });

/// An equal-priority newcomer goes to the tail of the list and does not
/// preempt.
#[test]
fn equal_priority_insert_does_not_preempt() {
    use no_preempt::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();

    spawn(&B, 5);
    assert!(current_is(&A));
    assert_eq!(System::thread_state(&B).unwrap(), ThreadSt::Ready);
}

kernel_test_env!(mod yields { levels: 16, quantum: 0 });

/// `thread_yield` passes the processor to the FIFO successor and round-trips
/// through the whole priority list.
#[test]
fn yield_passes_to_fifo_peer() {
    use yields::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 5);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::thread_yield().unwrap();
    assert!(current_is(&B));
    System::thread_yield().unwrap();
    assert!(current_is(&A));
}

kernel_test_env!(mod same_prio { levels: 16, quantum: 0 });

/// Re-asserting a thread's current priority must not move it within its
/// priority list.
#[test]
fn set_priority_same_value_keeps_fifo_order() {
    use same_prio::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;
    static C: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 5);
    spawn(&C, 5);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::thread_set_priority(&B, 5).unwrap();

    System::thread_yield().unwrap();
    assert!(current_is(&B));
    System::thread_yield().unwrap();
    assert!(current_is(&C));
    System::thread_yield().unwrap();
    assert!(current_is(&A));
}

kernel_test_env!(mod reprio { levels: 16, quantum: 0 });

/// Raising a ready thread's priority over the running thread preempts;
/// doing it again is idempotent.
#[test]
fn raise_priority_preempts() {
    use reprio::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 3);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::thread_set_priority(&B, 7).unwrap();
    assert!(current_is(&B));
    assert_eq!(System::thread_priority(&B).unwrap(), 7);

    System::thread_set_priority(&B, 7).unwrap();
    assert!(current_is(&B));
}

kernel_test_env!(mod deprio { levels: 16, quantum: 0 });

/// Lowering the running thread's priority below a ready thread forces a
/// re-selection.
#[test]
fn lower_running_thread_priority_reselects() {
    use deprio::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 4);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::thread_set_priority(&A, 3).unwrap();
    assert!(current_is(&B));
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Ready);
}

kernel_test_env!(mod sched_lock { levels: 16, quantum: 0 });

/// The scheduler lock defers preemption until the outermost `lock_exit`.
#[test]
fn scheduler_lock_defers_preemption() {
    use sched_lock::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static H: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();

    System::lock_enter().unwrap();
    System::lock_enter().unwrap();

    spawn(&H, 10);
    assert!(current_is(&A));

    System::lock_exit().unwrap();
    assert!(current_is(&A));

    System::lock_exit().unwrap();
    assert!(current_is(&H));
}

kernel_test_env!(mod deferred_rr { levels: 16, quantum: 2 });

/// A round-robin slice boundary that passes under the scheduler lock is
/// replayed as a single rotation at `lock_exit`.
#[test]
fn deferred_rotation_after_lock_exit() {
    use deferred_rr::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 5);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::lock_enter().unwrap();
    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert!(current_is(&A));

    System::lock_exit().unwrap();
    assert!(current_is(&B));
}

kernel_test_env!(mod terminate { levels: 16, quantum: 0 });

/// Terminating the running thread forces a switch; terminating a ready
/// thread only unlinks it.
#[test]
fn terminate_running_forces_switch() {
    use terminate::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;
    static C: ThreadCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    spawn(&B, 4);
    spawn(&C, 3);
    axon_port_std::boot::<Sys>();
    assert!(current_is(&A));

    System::thread_terminate(&C).unwrap();
    assert_eq!(System::thread_state(&C).unwrap(), ThreadSt::Terminated);
    assert!(current_is(&A));

    System::thread_terminate(&A).unwrap();
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Terminated);
    assert!(current_is(&B));

    // A terminated control block can be reused
    spawn(&A, 6);
    assert!(current_is(&A));
}

kernel_test_env!(mod idle { levels: 16, quantum: 0 });

/// When every application thread is blocked, the built-in idle thread runs.
#[test]
fn all_blocked_leaves_idle_running() {
    use idle::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    let _ = System::sem_wait(&S);
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Blocked);
    assert!(idle_is_current::<Sys>());

    System::sem_post(&S).unwrap();
    assert!(current_is(&A));
}

kernel_test_env!(mod isr_defer { levels: 16, quantum: 0 });

/// A wake-up from interrupt context does not switch inside the handler; the
/// switch is taken on return from the outermost interrupt.
#[test]
fn isr_wakeup_switches_at_epilogue() {
    use isr_defer::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    let _ = System::sem_wait(&S);
    assert!(idle_is_current::<Sys>());

    axon_port_std::raise_isr::<Sys, _>(|| {
        System::isr_prologue();
        System::sem_post(&S).unwrap();
        // Still inside the handler: the woken thread is Ready but not yet
        // dispatched
        assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Ready);
        assert!(idle_is_current::<Sys>());
        System::isr_epilogue();
    });

    assert!(current_is(&A));
}

kernel_test_env!(mod bad_args { levels: 16, quantum: 0 });

/// Argument validation at the thread API boundary.
#[test]
fn thread_init_validates_arguments() {
    use bad_args::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;

    // Kernel not initialized yet
    assert_eq!(
        System::thread_init(&A, noop_entry, 0, axon_port_std::alloc_stack(512), 512, 5),
        Err(InitThreadError::BadContext)
    );

    System::init().unwrap();

    // The idle priority and out-of-range priorities are rejected
    assert_eq!(
        System::thread_init(&A, noop_entry, 0, axon_port_std::alloc_stack(512), 512, 0),
        Err(InitThreadError::BadParam)
    );
    assert_eq!(
        System::thread_init(&A, noop_entry, 0, axon_port_std::alloc_stack(512), 512, 16),
        Err(InitThreadError::BadParam)
    );

    // Null or undersized stacks are rejected
    assert_eq!(
        System::thread_init(&A, noop_entry, 0, core::ptr::null_mut(), 512, 5),
        Err(InitThreadError::BadParam)
    );
    assert_eq!(
        System::thread_init(
            &A,
            noop_entry,
            0,
            axon_port_std::alloc_stack(16),
            16,
            5
        ),
        Err(InitThreadError::StackTooSmall)
    );

    spawn(&A, 5);

    // Double initialization
    assert_eq!(
        System::thread_init(&A, noop_entry, 0, axon_port_std::alloc_stack(512), 512, 5),
        Err(InitThreadError::BadObjectState)
    );
}
