//! Semaphore behavior: counting, blocking, wake-up order, timeouts, and
//! their interaction with thread termination.
use axon_kernel::{
    error::{PollSemaphoreError, WaitSemaphoreTimeoutError},
    utils::Init,
    SemaphoreCb, ThreadCb, ThreadSt,
};

#[macro_use]
mod common;
use common::{current_is, idle_is_current, spawn};

kernel_test_env!(mod counting { levels: 16, quantum: 0 });

/// A post with no waiters deposits a permit; a subsequent wait consumes it
/// without blocking, leaving the count unchanged overall.
#[test]
fn post_then_wait_round_trips() {
    use counting::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    System::sem_post(&S).unwrap();
    System::sem_wait(&S).unwrap();
    assert!(current_is(&A));

    // The permit is gone again
    assert_eq!(System::sem_poll(&S), Err(PollSemaphoreError::Timeout));
}

kernel_test_env!(mod poll { levels: 16, quantum: 0 });

/// `sem_poll` consumes permits without ever blocking.
#[test]
fn poll_never_blocks() {
    use poll::{Sys, System};
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 2).unwrap();

    System::sem_poll(&S).unwrap();
    System::sem_poll(&S).unwrap();
    assert_eq!(System::sem_poll(&S), Err(PollSemaphoreError::Timeout));
    assert!(idle_is_current::<Sys>());
}

kernel_test_env!(mod handoff { levels: 16, quantum: 0 });

/// A post with a blocked higher-priority waiter hands the permit over
/// directly - the waiter runs before the poster resumes, and the count never
/// moves.
#[test]
fn post_preempts_with_higher_priority_waiter() {
    use handoff::{Sys, System};
    static H: ThreadCb<Sys> = Init::INIT;
    static L: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&L, 1);
    spawn(&H, 10);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    // H is running; it blocks and L takes over
    assert!(current_is(&H));
    let _ = System::sem_wait(&S);
    assert_eq!(System::thread_state(&H).unwrap(), ThreadSt::Blocked);
    assert!(current_is(&L));

    // L posts: H gets the permit and the processor back
    System::sem_post(&S).unwrap();
    assert!(current_is(&H));
    assert_eq!(System::thread_state(&L).unwrap(), ThreadSt::Ready);

    // The permit was handed over, not deposited
    assert_eq!(System::sem_poll(&S), Err(PollSemaphoreError::Timeout));
}

kernel_test_env!(mod wake_order { levels: 16, quantum: 0 });

/// Waiters are woken in priority order, FIFO among equals.
#[test]
fn wakes_by_priority_then_fifo() {
    use wake_order::{Sys, System};
    static HI: ThreadCb<Sys> = Init::INIT;
    static MID1: ThreadCb<Sys> = Init::INIT;
    static MID2: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&HI, 7);
    spawn(&MID1, 5);
    spawn(&MID2, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    // Block all three, highest first (each wait passes the processor down)
    assert!(current_is(&HI));
    let _ = System::sem_wait(&S);
    assert!(current_is(&MID1));
    let _ = System::sem_wait(&S);
    assert!(current_is(&MID2));
    let _ = System::sem_wait(&S);
    assert!(idle_is_current::<Sys>());

    // Highest priority first
    System::sem_post(&S).unwrap();
    assert!(current_is(&HI));
    assert_eq!(System::thread_state(&MID1).unwrap(), ThreadSt::Blocked);
    assert_eq!(System::thread_state(&MID2).unwrap(), ThreadSt::Blocked);

    // FIFO among the equal-priority pair
    System::sem_post(&S).unwrap();
    assert_ne!(System::thread_state(&MID1).unwrap(), ThreadSt::Blocked);
    assert_eq!(System::thread_state(&MID2).unwrap(), ThreadSt::Blocked);

    System::sem_post(&S).unwrap();
    assert_ne!(System::thread_state(&MID2).unwrap(), ThreadSt::Blocked);
}

kernel_test_env!(mod timeout_expiry { levels: 16, quantum: 0 });

/// With no poster, a timed wait resolves to a timeout after exactly the
/// requested number of ticks, leaving the thread Ready.
#[test]
fn wait_timeout_expires() {
    use timeout_expiry::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    let _ = System::sem_wait_timeout(&S, 5);
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Blocked);

    for _ in 0..4 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Blocked);

    axon_port_std::tick::<Sys>();
    assert!(current_is(&A));
    assert!(System::thread_wait_timed_out(&A).unwrap());
}

kernel_test_env!(mod timeout_beaten { levels: 16, quantum: 0 });

/// A post that arrives before the timeout wins the race and disarms the
/// timeout timer.
#[test]
fn post_beats_timeout() {
    use timeout_beaten::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    let _ = System::sem_wait_timeout(&S, 5);
    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();

    System::sem_post(&S).unwrap();
    assert!(current_is(&A));
    assert!(!System::thread_wait_timed_out(&A).unwrap());

    // The disarmed timeout must not fire later
    for _ in 0..8 {
        axon_port_std::tick::<Sys>();
    }
    assert!(current_is(&A));
    assert!(!System::thread_wait_timed_out(&A).unwrap());
}

kernel_test_env!(mod terminate_waiter { levels: 16, quantum: 0 });

/// Terminating a blocked thread removes it from the waiter list and cancels
/// its timeout in the same critical section.
#[test]
fn terminate_removes_waiter_and_timeout() {
    use terminate_waiter::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    let _ = System::sem_wait_timeout(&S, 5);
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Blocked);

    System::thread_terminate(&A).unwrap();
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Terminated);

    // No waiter is left: a post deposits a permit instead of waking anyone
    System::sem_post(&S).unwrap();
    System::sem_poll(&S).unwrap();

    // The canceled timeout must not fire
    for _ in 0..8 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(System::thread_state(&A).unwrap(), ThreadSt::Terminated);
}

kernel_test_env!(mod zero_ticks { levels: 16, quantum: 0 });

/// A zero-tick timed wait is rejected before any state changes.
#[test]
fn wait_timeout_zero_is_bad_param() {
    use zero_ticks::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 0).unwrap();

    assert_eq!(
        System::sem_wait_timeout(&S, 0),
        Err(WaitSemaphoreTimeoutError::BadParam)
    );
    assert!(current_is(&A));
}

kernel_test_env!(mod immediate { levels: 16, quantum: 0 });

/// A wait against a positive count returns immediately without touching the
/// scheduler.
#[test]
fn wait_with_permits_does_not_block() {
    use immediate::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static S: SemaphoreCb<Sys> = Init::INIT;

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();
    System::sem_init(&S, 2).unwrap();

    let switches_before = axon_port_std::context_switch_count::<Sys>();
    System::sem_wait(&S).unwrap();
    System::sem_wait_timeout(&S, 5).unwrap();
    assert!(current_is(&A));
    assert_eq!(
        axon_port_std::context_switch_count::<Sys>(),
        switches_before
    );

    // Both permits are consumed; the armed-timeout path was never entered,
    // so the wheel is empty and ticks are inert
    axon_port_std::tick::<Sys>();
    assert!(current_is(&A));
    assert_eq!(System::sem_poll(&S), Err(PollSemaphoreError::Timeout));
}
