//! Thread blocking and priority-ordered waiter lists.
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    semaphore::SemaphoreCb,
    thread::{self, ThreadCb, ThreadSt},
    timeout::{self, Timeout},
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static},
        Init, UnwrapInfallible,
    },
    KernelTraits, PortThreading, UTicks,
};

/// The outcome of a completed wait, stored into the waiting thread's control
/// block by the wake-upper before the thread is made Ready.
pub(crate) type WaitResult = Result<(), TimedOut>;

/// Marker for a wait that was ended by its timeout rather than by a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimedOut;

/// The wait state of a thread.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The semaphore the thread is blocked on. `Some` iff the thread is in
    /// the Blocked state.
    waited: CpuLockCell<Traits, Option<&'static SemaphoreCb<Traits>>>,

    /// The result of the last completed wait.
    result: CpuLockCell<Traits, WaitResult>,

    /// Timeout node armed by `sem_wait_timeout`. Living in the control block
    /// (rather than on the waiting thread's stack) ties its lifetime to the
    /// thread's, so the wheel can never hold a dangling node.
    pub(crate) timeout: Timeout<Traits>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waited: Init::INIT,
        result: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: PortThreading> ThreadWait<Traits> {
    /// Reset the wait bookkeeping of a thread being (re)initialized.
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        debug_assert!(!self.timeout.is_linked(lock.borrow_mut()));
        self.waited.replace(&mut *lock, None);
        self.result.replace(&mut *lock, Ok(()));
    }

    /// The result of the thread's last completed wait.
    pub(crate) fn last_result(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> WaitResult {
        self.result.get(&*lock)
    }
}

impl<Traits: PortThreading> fmt::Debug for ThreadWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadWait")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access a semaphore's waiter list.
macro_rules! wait_queue_accessor {
    ($sem:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new(
            &$sem.waiters,
            &Static,
            |thread: &ThreadCb<Traits>| &thread.queue_link,
            $key,
        );

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

/// Block the running thread on `sem` until posted. Returns once the thread
/// is resumed; the wait result was stored by whoever woke it.
pub(crate) fn wait<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> (CpuLockGuard<Traits>, WaitResult) {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    block_current_thread(lock.borrow_mut(), sem, thread, None);
    finish_wait(lock, thread)
}

/// Like [`wait`], but additionally arms the thread's embedded timeout to end
/// the wait with [`TimedOut`] after `ticks` ticks.
pub(crate) fn wait_timeout<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    ticks: UTicks,
) -> (CpuLockGuard<Traits>, WaitResult) {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    block_current_thread(lock.borrow_mut(), sem, thread, Some(ticks));
    finish_wait(lock, thread)
}

/// Relinquish the lock - the port switches away here - and pick up the wait
/// result after resumption.
fn finish_wait<Traits: KernelTraits>(
    lock: CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) -> (CpuLockGuard<Traits>, WaitResult) {
    drop(lock);

    // When the thread regains the processor, execution resumes here with the
    // wait already resolved. The mask is at its base level in thread context,
    // so re-acquiring the lock can't fail.
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let result = thread.wait.result.get(&*lock);
    (lock, result)
}

/// Transition the running thread into the Blocked state: leave the ready
/// array, enter `sem`'s waiter list at the priority position, optionally arm
/// the wait timeout, and re-run the dispatch decision.
fn block_current_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    thread: &'static ThreadCb<Traits>,
    timeout_ticks: Option<UTicks>,
) {
    debug_assert_eq!(thread.st.get(&*lock), ThreadSt::Running);

    // Safety: A Running thread is linked in the ready array
    unsafe { thread::make_unready(lock.borrow_mut(), thread) };

    thread.st.replace(&mut *lock, ThreadSt::Blocked);
    thread.wait.waited.replace(&mut *lock, Some(sem));
    thread.wait.result.replace(&mut *lock, Ok(()));

    let priority = thread.priority.get(&*lock);
    let insert_at = find_insertion_position(lock.borrow_mut(), sem, priority);
    let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
    // Safety: The thread was just unlinked from the ready array
    unsafe { accessor.insert(Ident(thread), insert_at).unwrap_unchecked() };

    if let Some(ticks) = timeout_ticks {
        thread.wait.timeout.prepare(
            lock.borrow_mut(),
            wake_by_timeout::<Traits>,
            thread as *const ThreadCb<Traits> as usize,
        );
        timeout::insert_timeout(lock.borrow_mut(), &thread.wait.timeout, ticks);
    }

    thread::reschedule::<Traits>(lock);
}

/// Find the insertion position for a waiter of priority `priority`.
///
/// The waiter list is ordered by descending priority, FIFO among equals:
/// walking from the back, the new waiter is inserted before every strictly
/// lower-priority waiter but after its equals.
fn find_insertion_position<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    priority: usize,
) -> Option<Ident<&'static ThreadCb<Traits>>> {
    let accessor = wait_queue_accessor!(sem, lock.borrow_mut());

    let mut insert_at = None;
    let mut cursor = accessor.back().unwrap_infallible();
    while let Some(candidate) = cursor {
        if candidate.0.priority.get(&**accessor.cell_key()) < priority {
            // The new waiter goes before this one; keep searching, there may
            // be an even earlier viable position
            insert_at = Some(candidate);
            // Safety: `candidate` is linked, so `prev` shouldn't return
            //         `ItemError::NotLinked`.
            cursor = unsafe { accessor.prev(candidate).unwrap_unchecked() };
        } else {
            break;
        }
    }
    insert_at
}

/// Wake up the highest-priority waiter of `sem`, if any. Returns `true` when
/// a thread was woken.
///
/// This may make a thread Ready but doesn't yield the processor. Call
/// `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn wake_up_one<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) -> bool {
    let head = {
        let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
        accessor.pop_front().unwrap_infallible()
    };
    let Some(Ident(thread)) = head else {
        return false;
    };

    complete_wait(lock, thread, Ok(()));
    true
}

/// The timeout callback ending a wait with [`TimedOut`].
///
/// By the time this runs the wheel has already unlinked the timeout node, so
/// a post that races with the timeout is resolved by whichever acquires the
/// interrupt-masking lock first; the loser finds the thread no longer
/// Blocked and does nothing.
fn wake_by_timeout<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was produced from a `&'static ThreadCb` when the
    //         timeout was armed, and the timeout is disarmed before the
    //         control block can be terminated
    let thread = unsafe { &*(param as *const ThreadCb<Traits>) };

    if thread.st.get(&*lock) == ThreadSt::Blocked {
        if let Some(sem) = thread.wait.waited.get(&*lock) {
            let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
            // Safety: A Blocked thread is linked in its semaphore's waiter
            //         list
            unsafe { accessor.remove(Ident(thread)).unwrap_unchecked() };
        }
        complete_wait(lock.borrow_mut(), thread, Err(TimedOut));
    }

    lock
}

/// Deliver `result`, disarm any armed timeout, and make the thread Ready.
///
/// The caller must have already unlinked the thread from its waiter list.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    result: WaitResult,
) {
    // No-op when the timeout already fired (or was never armed); this is the
    // single transition that resolves post vs. timeout
    timeout::remove_timeout(lock.borrow_mut(), &thread.wait.timeout);

    thread.wait.waited.replace(&mut *lock, None);
    thread.wait.result.replace(&mut *lock, result);

    debug_assert_eq!(thread.st.get(&*lock), ThreadSt::Blocked);

    // Safety: The thread is not in any queue, and a Blocked thread's
    //         execution context is valid and ready to resume
    unsafe { thread::make_ready(lock, thread) };
}

/// Unlink a Blocked thread from its waiter list and disarm its timeout, in
/// one critical section. Used by `thread_terminate`; no result is delivered
/// because the thread never runs again.
pub(crate) fn cancel_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if let Some(sem) = thread.wait.waited.get(&*lock) {
        let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
        // Safety: A Blocked thread is linked in its semaphore's waiter list
        unsafe { accessor.remove(Ident(thread)).unwrap_unchecked() };
    }
    timeout::remove_timeout(lock.borrow_mut(), &thread.wait.timeout);
    thread.wait.waited.replace(&mut *lock, None);
}

/// Reposition a Blocked thread within its waiter list after a priority
/// change. Does nothing for a thread that isn't waiting.
pub(crate) fn reorder_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let Some(sem) = thread.wait.waited.get(&*lock) else {
        return;
    };

    {
        let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
        // Safety: A Blocked thread is linked in its semaphore's waiter list
        unsafe { accessor.remove(Ident(thread)).unwrap_unchecked() };
    }

    let priority = thread.priority.get(&*lock);
    let insert_at = find_insertion_position(lock.borrow_mut(), sem, priority);
    let mut accessor = wait_queue_accessor!(sem, lock.borrow_mut());
    // Safety: The thread was just unlinked
    unsafe { accessor.insert(Ident(thread), insert_at).unwrap_unchecked() };
}
