//! Timers
use core::fmt;

use crate::{
    error::{CancelTimerError, InitTimerError, QueryTimerError, StartTimerError},
    klock::{self, CpuLockCell, CpuLockGuard},
    state::{self, ExecState},
    timeout::{self, Timeout},
    utils::Init,
    KernelTraits, PortThreading, System, UTicks,
};

bitflags::bitflags! {
    /// Mode flags for [`System::timer_start`].
    pub struct TimerFlags: u8 {
        /// Fire once, then disarm.
        const ONE_SHOT = 0;
        /// Re-arm with the same interval after each firing. The phase is
        /// preserved against the reload: each deadline is exactly one
        /// interval after the previous one, regardless of callback latency.
        const PERIODIC = 1 << 0;
    }
}

/// Integrity tag of an initialized [`TimerCb`].
pub(crate) const TIMER_SIGNATURE: u32 = 0x71c7_0c25;

/// *Timer control block* - the state data of a software timer.
///
/// Owned by the application, usually as a `static` initialized with
/// [`Init::INIT`] and prepared with [`System::timer_init`].
pub struct TimerCb<Traits: PortThreading> {
    /// The wheel node carrying this timer's deadline.
    pub(crate) timeout: Timeout<Traits>,

    /// The re-arm interval; 0 for a one-shot timer.
    pub(crate) period: CpuLockCell<Traits, UTicks>,

    /// `true` between `timer_start` and the final firing or `timer_cancel`.
    pub(crate) active: CpuLockCell<Traits, bool>,

    pub(crate) callback: CpuLockCell<Traits, fn(usize)>,
    pub(crate) argument: CpuLockCell<Traits, usize>,

    /// Integrity tag, set by `timer_init`.
    pub(crate) signature: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        timeout: Init::INIT,
        period: Init::INIT,
        active: Init::INIT,
        callback: CpuLockCell::new(|_| {}),
        argument: Init::INIT,
        signature: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("timeout", &self.timeout)
            .field("period", &self.period)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// These associated functions implement the timer operations.
impl<Traits: KernelTraits> System<Traits> {
    /// Prepare a timer control block for use.
    pub fn timer_init(timer: &'static TimerCb<Traits>) -> Result<(), InitTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if timer.timeout.is_linked(lock.borrow_mut()) {
            return Err(InitTimerError::BadObjectState);
        }

        timer.period.replace(&mut *lock, 0);
        timer.active.replace(&mut *lock, false);
        timer.signature.replace(&mut *lock, TIMER_SIGNATURE);
        Ok(())
    }

    /// Arm a timer to call `callback(argument)` after `ticks` ticks, and -
    /// with [`TimerFlags::PERIODIC`] - every `ticks` ticks thereafter.
    ///
    /// The callback runs in interrupt context, outside the kernel critical
    /// section; it must not block, but it may start or cancel timers,
    /// including this one.
    pub fn timer_start(
        timer: &'static TimerCb<Traits>,
        ticks: UTicks,
        callback: fn(usize),
        argument: usize,
        flags: TimerFlags,
    ) -> Result<(), StartTimerError> {
        if ticks == 0 {
            return Err(StartTimerError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        // The wheel exists only after `System::init`
        if state::exec_state::<Traits>(lock.borrow_mut()) == ExecState::Inactive {
            return Err(StartTimerError::BadContext);
        }
        if timer.signature.get(&*lock) != TIMER_SIGNATURE {
            return Err(StartTimerError::BadObjectState);
        }
        if timer.timeout.is_linked(lock.borrow_mut()) {
            // Starting an already-armed timer
            return Err(StartTimerError::BadObjectState);
        }

        timer.callback.replace(&mut *lock, callback);
        timer.argument.replace(&mut *lock, argument);
        timer.period.replace(
            &mut *lock,
            if flags.contains(TimerFlags::PERIODIC) {
                ticks
            } else {
                0
            },
        );
        timer.active.replace(&mut *lock, true);

        timer.timeout.prepare(
            lock.borrow_mut(),
            timer_expired::<Traits>,
            timer as *const TimerCb<Traits> as usize,
        );
        timeout::insert_timeout(lock.borrow_mut(), &timer.timeout, ticks);
        Ok(())
    }

    /// Disarm a timer. Safe to call on a timer that isn't armed; once this
    /// returns, the callback will not fire again.
    pub fn timer_cancel(timer: &'static TimerCb<Traits>) -> Result<(), CancelTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        timeout::remove_timeout(lock.borrow_mut(), &timer.timeout);
        timer.active.replace(&mut *lock, false);
        Ok(())
    }

    /// Get a flag indicating whether the timer is armed.
    pub fn timer_is_running(timer: &'static TimerCb<Traits>) -> Result<bool, QueryTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timer.timeout.is_linked(lock.borrow_mut()))
    }

    /// Get the number of ticks until the timer fires, 0 if it isn't armed.
    /// O(n) in the number of earlier timeouts.
    pub fn timer_remaining(timer: &'static TimerCb<Traits>) -> Result<UTicks, QueryTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::remaining_ticks(lock.borrow_mut(), &timer.timeout))
    }
}

/// The wheel callback for an expired timer.
///
/// A periodic timer is re-armed *before* the user callback runs, so the
/// callback observes a consistent "armed for the next interval" state and
/// can cancel its own re-armed instance.
fn timer_expired<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was produced from a `&'static TimerCb` by `timer_start`
    let timer = unsafe { &*(param as *const TimerCb<Traits>) };

    debug_assert!(!timer.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer.active.get(&*lock));

    let period = timer.period.get(&*lock);
    if period != 0 {
        timeout::insert_timeout(lock.borrow_mut(), &timer.timeout, period);
    } else {
        timer.active.replace(&mut *lock, false);
    }

    let callback = timer.callback.get(&*lock);
    let argument = timer.argument.get(&*lock);

    // Release the kernel critical section around the user callback; it runs
    // in interrupt context with the tick handler's mask level
    drop(lock);
    callback(argument);

    // The mask is back at the tick handler's level, so this can't fail
    // unless the callback left a critical section open
    klock::lock_cpu::<Traits>().unwrap()
}
