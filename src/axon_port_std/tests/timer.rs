//! Timer wheel behavior: deadline ordering, delta bookkeeping, periodic
//! re-arming, cancellation, and the adaptive tick source.
use std::sync::atomic::{AtomicU32, Ordering};

use axon_kernel::{error::StartTimerError, utils::Init, ThreadCb, TimerCb, TimerFlags};

#[macro_use]
mod common;
use common::spawn;

fn bump(arg: usize) {
    let counter = unsafe { &*(arg as *const AtomicU32) };
    counter.fetch_add(1, Ordering::SeqCst);
}

fn counter_arg(counter: &'static AtomicU32) -> usize {
    counter as *const AtomicU32 as usize
}

kernel_test_env!(mod two_timers { levels: 16, quantum: 0 });

/// A 3-tick and a 5-tick timer fire on their own deadlines.
#[test]
fn timers_fire_in_deadline_order() {
    use two_timers::{Sys, System};
    static T1: TimerCb<Sys> = Init::INIT;
    static T2: TimerCb<Sys> = Init::INIT;
    static FIRED1: AtomicU32 = AtomicU32::new(0);
    static FIRED2: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T1).unwrap();
    System::timer_init(&T2).unwrap();
    System::timer_start(&T1, 3, bump, counter_arg(&FIRED1), TimerFlags::ONE_SHOT).unwrap();
    System::timer_start(&T2, 5, bump, counter_arg(&FIRED2), TimerFlags::ONE_SHOT).unwrap();

    assert_eq!(System::timer_remaining(&T1).unwrap(), 3);
    assert_eq!(System::timer_remaining(&T2).unwrap(), 5);

    for _ in 0..2 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED1.load(Ordering::SeqCst), 0);

    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED1.load(Ordering::SeqCst), 1);
    assert_eq!(FIRED2.load(Ordering::SeqCst), 0);
    assert!(!System::timer_is_running(&T1).unwrap());

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED2.load(Ordering::SeqCst), 1);
}

kernel_test_env!(mod periodic { levels: 16, quantum: 0 });

/// A periodic timer with reload 4 fires at t = 4, 8; a cancel at t = 10
/// prevents the t = 12 firing and all later ones.
#[test]
fn periodic_timer_fires_until_canceled() {
    use periodic::{Sys, System};
    static T: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T).unwrap();
    System::timer_start(&T, 4, bump, counter_arg(&FIRED), TimerFlags::PERIODIC).unwrap();

    for _ in 0..4 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    // Re-armed for the next interval, phase preserved
    assert!(System::timer_is_running(&T).unwrap());
    assert_eq!(System::timer_remaining(&T).unwrap(), 4);

    for _ in 0..4 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    System::timer_cancel(&T).unwrap();
    assert!(!System::timer_is_running(&T).unwrap());

    for _ in 0..8 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
}

kernel_test_env!(mod next_tick { levels: 16, quantum: 0 });

/// A timer started with `ticks = 1` fires on the very next tick.
#[test]
fn one_tick_timer_fires_on_next_tick() {
    use next_tick::{Sys, System};
    static T: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T).unwrap();
    System::timer_start(&T, 1, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();

    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    // A one-shot control block can be re-armed after firing
    System::timer_start(&T, 1, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();
    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
}

kernel_test_env!(mod cancellation { levels: 16, quantum: 0 });

/// Canceling a timer returns its delta to the successor, leaving every other
/// deadline intact.
#[test]
fn cancel_preserves_other_deadlines() {
    use cancellation::{Sys, System};
    static T1: TimerCb<Sys> = Init::INIT;
    static T2: TimerCb<Sys> = Init::INIT;
    static T3: TimerCb<Sys> = Init::INIT;
    static FIRED1: AtomicU32 = AtomicU32::new(0);
    static FIRED2: AtomicU32 = AtomicU32::new(0);
    static FIRED3: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    for timer in [&T1, &T2, &T3] {
        System::timer_init(timer).unwrap();
    }
    System::timer_start(&T1, 3, bump, counter_arg(&FIRED1), TimerFlags::ONE_SHOT).unwrap();
    System::timer_start(&T2, 7, bump, counter_arg(&FIRED2), TimerFlags::ONE_SHOT).unwrap();
    System::timer_start(&T3, 10, bump, counter_arg(&FIRED3), TimerFlags::ONE_SHOT).unwrap();

    System::timer_cancel(&T2).unwrap();

    // The canceled timer's delta was folded into its successor
    assert_eq!(System::timer_remaining(&T1).unwrap(), 3);
    assert_eq!(System::timer_remaining(&T2).unwrap(), 0);
    assert_eq!(System::timer_remaining(&T3).unwrap(), 10);

    // Canceling a non-queued timer is a no-op
    System::timer_cancel(&T2).unwrap();

    for _ in 0..3 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED1.load(Ordering::SeqCst), 1);

    for _ in 0..7 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED2.load(Ordering::SeqCst), 0);
    assert_eq!(FIRED3.load(Ordering::SeqCst), 1);
}

kernel_test_env!(mod countdown { levels: 16, quantum: 0 });

/// `timer_remaining` counts down tick by tick.
#[test]
fn remaining_counts_down() {
    use countdown::{Sys, System};
    static T: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T).unwrap();
    assert!(!System::timer_is_running(&T).unwrap());
    assert_eq!(System::timer_remaining(&T).unwrap(), 0);

    System::timer_start(&T, 5, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();
    assert!(System::timer_is_running(&T).unwrap());

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert_eq!(System::timer_remaining(&T).unwrap(), 3);

    for _ in 0..3 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert_eq!(System::timer_remaining(&T).unwrap(), 0);
}

kernel_test_env!(mod ties { levels: 16, quantum: 0 });

/// Timers sharing a deadline fire in insertion order.
#[test]
fn equal_deadlines_fire_in_insertion_order() {
    use ties::{Sys, System};
    static T1: TimerCb<Sys> = Init::INIT;
    static T2: TimerCb<Sys> = Init::INIT;
    static ORDER: AtomicU32 = AtomicU32::new(0);

    fn first(_: usize) {
        assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 0);
    }
    fn second(_: usize) {
        assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 1);
    }

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T1).unwrap();
    System::timer_init(&T2).unwrap();
    System::timer_start(&T1, 3, first, 0, TimerFlags::ONE_SHOT).unwrap();
    System::timer_start(&T2, 3, second, 0, TimerFlags::ONE_SHOT).unwrap();

    for _ in 0..3 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(ORDER.load(Ordering::SeqCst), 2);
}

kernel_test_env!(mod self_cancel { levels: 16, quantum: 0 });

/// A periodic timer is re-armed before its callback runs, so the callback
/// can cancel its own re-armed instance.
#[test]
fn periodic_callback_can_cancel_itself() {
    use self_cancel::{Sys, System};
    static T: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn cancel_self(arg: usize) {
        let timer = unsafe { &*(arg as *const TimerCb<Sys>) };
        assert!(System::timer_is_running(timer).unwrap());
        System::timer_cancel(timer).unwrap();
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    System::timer_init(&T).unwrap();
    System::timer_start(
        &T,
        2,
        cancel_self,
        &T as *const TimerCb<Sys> as usize,
        TimerFlags::PERIODIC,
    )
    .unwrap();

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert!(!System::timer_is_running(&T).unwrap());

    for _ in 0..4 {
        axon_port_std::tick::<Sys>();
    }
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
}

kernel_test_env!(mod misuse { levels: 16, quantum: 0 });

/// Misuse of the timer API is reported, not acted upon.
#[test]
fn timer_start_validates_state() {
    use misuse::{Sys, System};
    static T: TimerCb<Sys> = Init::INIT;
    static UNINIT: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    axon_port_std::boot::<Sys>();

    // An uninitialized control block can't be started
    assert_eq!(
        System::timer_start(&UNINIT, 1, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT),
        Err(StartTimerError::BadObjectState)
    );

    System::timer_init(&T).unwrap();

    assert_eq!(
        System::timer_start(&T, 0, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT),
        Err(StartTimerError::BadParam)
    );

    System::timer_start(&T, 5, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();
    assert_eq!(
        System::timer_start(&T, 5, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT),
        Err(StartTimerError::BadObjectState)
    );

    // Cancel, then re-arm
    System::timer_cancel(&T).unwrap();
    System::timer_start(&T, 5, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();
}

kernel_test_env!(mod adaptive { levels: 16, quantum: 2, adaptive_tick: true });

/// With the adaptive tick, the tick interrupt is unmasked exactly while a
/// timeout is pending or a priority level holds two runnable threads.
#[test]
fn adaptive_tick_follows_consumers() {
    use adaptive::{Sys, System};
    static A: ThreadCb<Sys> = Init::INIT;
    static B: ThreadCb<Sys> = Init::INIT;
    static T: TimerCb<Sys> = Init::INIT;
    static FIRED: AtomicU32 = AtomicU32::new(0);

    System::init().unwrap();
    spawn(&A, 5);
    axon_port_std::boot::<Sys>();

    // Nothing consumes ticks yet
    assert!(!axon_port_std::is_tick_enabled::<Sys>());

    // A pending timeout needs the tick
    System::timer_init(&T).unwrap();
    System::timer_start(&T, 2, bump, counter_arg(&FIRED), TimerFlags::ONE_SHOT).unwrap();
    assert!(axon_port_std::is_tick_enabled::<Sys>());

    axon_port_std::tick::<Sys>();
    axon_port_std::tick::<Sys>();
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert!(!axon_port_std::is_tick_enabled::<Sys>());

    // A second runnable thread at A's priority needs round-robin ticks
    spawn(&B, 5);
    assert!(axon_port_std::is_tick_enabled::<Sys>());

    System::thread_terminate(&B).unwrap();
    assert!(!axon_port_std::is_tick_enabled::<Sys>());
}
