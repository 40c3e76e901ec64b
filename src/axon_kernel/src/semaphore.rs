//! Semaphores
use core::fmt;

use crate::{
    error::{
        InitSemaphoreError, PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock::{self, CpuLockCell},
    state, thread,
    utils::{intrusive_list::StaticListHead, Init},
    wait::{self, TimedOut},
    KernelTraits, PortThreading, System, ThreadCb, UTicks,
};

/// *Semaphore control block* - a counting semaphore.
///
/// Owned by the application, usually as a `static` initialized with
/// [`Init::INIT`] (count 0) and configured with [`System::sem_init`].
pub struct SemaphoreCb<Traits: PortThreading> {
    /// The number of available permits.
    pub(crate) count: CpuLockCell<Traits, u32>,

    /// Threads blocked on this semaphore, ordered by descending priority,
    /// FIFO among equals. Linked through [`ThreadCb::queue_link`].
    pub(crate) waiters: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        count: Init::INIT,
        waiters: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// These associated functions implement the semaphore operations.
impl<Traits: KernelTraits> System<Traits> {
    /// Set a semaphore's count. The waiter list must be empty.
    pub fn sem_init(
        sem: &'static SemaphoreCb<Traits>,
        count: u32,
    ) -> Result<(), InitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if !sem.waiters.get(&*lock).is_empty() {
            return Err(InitSemaphoreError::BadObjectState);
        }
        sem.count.replace(&mut *lock, count);
        Ok(())
    }

    /// Acquire a permit, blocking until one is available.
    pub fn sem_wait(sem: &'static SemaphoreCb<Traits>) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

        if poll_core(sem.count.write(&mut *lock)) {
            return Ok(());
        }

        let (lock, result) = wait::wait(sem, lock);
        drop(lock);
        match result {
            Ok(()) => Ok(()),
            Err(TimedOut) => unreachable!("got a timeout result for an untimed wait"),
        }
    }

    /// Acquire a permit, blocking no longer than `ticks` ticks.
    ///
    /// Whichever of the post and the timeout happens first resolves the
    /// wait; the distinction is reported through the return value.
    pub fn sem_wait_timeout(
        sem: &'static SemaphoreCb<Traits>,
        ticks: UTicks,
    ) -> Result<(), WaitSemaphoreTimeoutError> {
        if ticks == 0 {
            return Err(WaitSemaphoreTimeoutError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

        if poll_core(sem.count.write(&mut *lock)) {
            return Ok(());
        }

        let (lock, result) = wait::wait_timeout(sem, lock, ticks);
        drop(lock);
        result.map_err(|TimedOut| WaitSemaphoreTimeoutError::Timeout)
    }

    /// Acquire a permit without blocking.
    pub fn sem_poll(sem: &'static SemaphoreCb<Traits>) -> Result<(), PollSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if poll_core(sem.count.write(&mut *lock)) {
            Ok(())
        } else {
            Err(PollSemaphoreError::Timeout)
        }
    }

    /// Release a permit.
    ///
    /// If a thread is waiting, the highest-priority waiter (FIFO among
    /// equals) receives the permit directly, its pending timeout is
    /// canceled, and it preempts the caller when it out-prioritizes it.
    /// Otherwise the count is incremented. Callable from kernel-level
    /// interrupt handlers; the resulting switch is then taken at the
    /// outermost ISR epilogue.
    pub fn sem_post(sem: &'static SemaphoreCb<Traits>) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if wait::wake_up_one(lock.borrow_mut(), sem) {
            // We just woke up a thread and gave it the permit; check dispatch
            thread::unlock_cpu_and_check_preemption::<Traits>(lock);
        } else {
            let count = sem.count.get(&*lock);
            debug_assert_ne!(count, u32::MAX);
            sem.count.replace(&mut *lock, count.wrapping_add(1));
        }

        Ok(())
    }
}

/// Check if the current state of a semaphore, `count`, satisfies the wait
/// condition.
///
/// If `count` satisfies the wait condition, this function updates `count`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(count: &mut u32) -> bool {
    if *count > 0 {
        *count -= 1;
        true
    } else {
        false
    }
}
