//! Threads
use core::fmt;

use crate::{
    error::{
        GetCurrentThreadError, InitThreadError, QueryThreadError, SetThreadPriorityError,
        TerminateThreadError, YieldThreadError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state::{self, ExecState},
    tick,
    utils::{intrusive_list::StaticLink, Init},
    wait, CompletedSwitch, KernelTraits, PortThreading, System, UTicks,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

/// The priority level reserved for the built-in idle thread. Application
/// threads use `IDLE_PRIORITY + 1 .. PRIORITY_LEVELS`.
pub const IDLE_PRIORITY: usize = 0;

/// Integrity tag of a live [`ThreadCb`].
pub(crate) const THREAD_SIGNATURE: u32 = 0x517e_ad51;

/// *Thread control block* - the state data of a thread.
///
/// Owned by the application, usually as a `static` initialized with
/// [`Init::INIT`]; the kernel only borrows it through intrusive links. A
/// control block may be reused or reclaimed once the thread is Terminated.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// Port-specific per-thread state; the saved stack pointer lives here.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembler code can refer to it easily.
    pub port_state: Traits::PortThreadState,

    /// The priority assigned at creation.
    pub(crate) base_priority: CpuLockCell<Traits, usize>,

    /// The current effective priority. Today this always tracks
    /// `base_priority`; a locking protocol layered on top may boost it.
    pub(crate) priority: CpuLockCell<Traits, usize>,

    /// The round-robin slice length, loaded into `quantum` at each rotation.
    pub(crate) quantum_reload: CpuLockCell<Traits, UTicks>,

    /// Ticks left in the current round-robin slice.
    pub(crate) quantum: CpuLockCell<Traits, UTicks>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// Intrusive list node.
    ///
    /// A thread is linked into at most one queue at any time: the ready
    /// array while Ready or Running, a semaphore's waiter list while
    /// Blocked. `None` ⇒ not queued.
    pub(crate) queue_link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,

    /// The wait state of the thread.
    pub(crate) wait: wait::ThreadWait<Traits>,

    /// Integrity tag, set on valid construction and cleared on termination.
    pub(crate) signature: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for ThreadCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_state: Init::INIT,
        base_priority: Init::INIT,
        priority: Init::INIT,
        quantum_reload: Init::INIT,
        quantum: Init::INIT,
        st: Init::INIT,
        queue_link: Init::INIT,
        wait: Init::INIT,
        signature: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("port_state", &self.port_state)
            .field("priority", &self.priority)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Thread state machine
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// Runnable and linked in the ready array.
    Ready,
    /// Holding the processor. Still linked in the ready array at its
    /// rotation position.
    Running,
    /// Waiting on a kernel object; linked in its waiter list.
    Blocked,
    /// Not live. The initial state of a fresh control block, and the final
    /// state after `thread_terminate`.
    Terminated,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Terminated;
}

/// These associated functions implement the thread lifecycle operations.
impl<Traits: KernelTraits> System<Traits> {
    /// Initialize a thread and make it Ready.
    ///
    /// The new thread preempts the caller immediately iff its priority is
    /// strictly higher than the running thread's. Callable from the Init
    /// state (before [`System::start`]) to create the initial thread set.
    pub fn thread_init(
        thread: &'static ThreadCb<Traits>,
        entry: fn(usize),
        param: usize,
        stack_base: *mut u8,
        stack_size: usize,
        priority: usize,
    ) -> Result<(), InitThreadError> {
        if priority <= IDLE_PRIORITY || priority >= Traits::PRIORITY_LEVELS {
            return Err(InitThreadError::BadParam);
        }
        if stack_base.is_null() {
            return Err(InitThreadError::BadParam);
        }
        if stack_size < Traits::STACK_MIN_SIZE {
            return Err(InitThreadError::StackTooSmall);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        if state::exec_state::<Traits>(lock.borrow_mut()) == ExecState::Inactive {
            return Err(InitThreadError::BadContext);
        }
        if thread.signature.get(&*lock) == THREAD_SIGNATURE {
            // Double initialization
            return Err(InitThreadError::BadObjectState);
        }
        debug_assert_eq!(thread.st.get(&*lock), ThreadSt::Terminated);

        // Safety: The thread is not live, and the caller vouches for the
        //         stack region
        unsafe { Traits::initialize_thread_state(thread, entry, param, stack_base, stack_size) };

        thread.base_priority.replace(&mut *lock, priority);
        thread.priority.replace(&mut *lock, priority);
        thread
            .quantum_reload
            .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
        thread
            .quantum
            .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
        thread.wait.reset(lock.borrow_mut());
        thread.signature.replace(&mut *lock, THREAD_SIGNATURE);

        // Safety: The thread is not in any queue, and its context was just
        //         initialized
        unsafe { make_ready(lock.borrow_mut(), thread) };

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Remove a thread from all kernel structures and mark it Terminated.
    ///
    /// A Blocked thread is unlinked from its waiter list, and any armed
    /// timeout is canceled, in the same critical section. Terminating the
    /// running thread forces a reschedule; the terminating thread never
    /// resumes.
    pub fn thread_terminate(
        thread: &'static ThreadCb<Traits>,
    ) -> Result<(), TerminateThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if thread.signature.get(&*lock) != THREAD_SIGNATURE {
            return Err(TerminateThreadError::BadObjectState);
        }

        match thread.st.get(&*lock) {
            ThreadSt::Ready | ThreadSt::Running => {
                // Safety: Ready and Running threads are linked in the ready
                //         array
                unsafe { make_unready(lock.borrow_mut(), thread) };
            }
            ThreadSt::Blocked => {
                wait::cancel_wait(lock.borrow_mut(), thread);
            }
            ThreadSt::Terminated => return Err(TerminateThreadError::BadObjectState),
        }

        thread.st.replace(&mut *lock, ThreadSt::Terminated);
        thread.signature.replace(&mut *lock, 0);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Terminate the calling thread. Never returns.
    ///
    /// Ports build their synthetic stack frames so that a thread's entry
    /// function falls through to this when it returns.
    pub fn thread_exit() -> ! {
        let thread = Self::thread_current().expect("`thread_exit` called outside a thread");
        Self::thread_terminate(thread).expect("the calling thread is not live");

        // The switch away is taken as the terminate call restores the
        // interrupt mask; execution never gets back here
        unreachable!("a terminated thread was resumed")
    }

    /// Get the running thread.
    pub fn thread_current() -> Result<&'static ThreadCb<Traits>, GetCurrentThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state()
            .running_thread(lock.borrow_mut())
            .ok_or(GetCurrentThreadError::BadContext)
    }

    /// Get a thread's lifecycle state.
    pub fn thread_state(thread: &ThreadCb<Traits>) -> Result<ThreadSt, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(thread.st.get(&*lock))
    }

    /// Get a thread's current effective priority.
    pub fn thread_priority(thread: &ThreadCb<Traits>) -> Result<usize, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(thread.priority.get(&*lock))
    }

    /// Get a flag indicating whether the thread's last completed wait ended
    /// with a timeout. Intended for test harnesses and debuggers.
    #[doc(hidden)]
    pub fn thread_wait_timed_out(thread: &ThreadCb<Traits>) -> Result<bool, QueryThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(thread.wait.last_result(lock.borrow_mut()).is_err())
    }

    /// Change a thread's priority.
    ///
    /// Setting the current priority again is a no-op and in particular does
    /// not perturb the thread's FIFO position. Otherwise the thread is
    /// re-inserted at the tail of its new priority list (or repositioned in
    /// its waiter list when Blocked), and a reschedule runs when the change
    /// could affect the dispatch decision.
    pub fn thread_set_priority(
        thread: &'static ThreadCb<Traits>,
        priority: usize,
    ) -> Result<(), SetThreadPriorityError> {
        if priority <= IDLE_PRIORITY || priority >= Traits::PRIORITY_LEVELS {
            return Err(SetThreadPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        if thread.signature.get(&*lock) != THREAD_SIGNATURE {
            return Err(SetThreadPriorityError::BadObjectState);
        }
        if thread.priority.get(&*lock) == priority {
            return Ok(());
        }

        match thread.st.get(&*lock) {
            ThreadSt::Ready | ThreadSt::Running => {
                // Safety: Ready and Running threads are linked in the ready
                //         array
                unsafe { make_unready(lock.borrow_mut(), thread) };
                thread.base_priority.replace(&mut *lock, priority);
                thread.priority.replace(&mut *lock, priority);
                // Safety: We just unlinked the thread
                unsafe { enqueue_ready(lock.borrow_mut(), thread) };

                // Raising can preempt the running thread; lowering the
                // running thread's own priority forces a re-selection. Both
                // fall out of the cleared pending selection.
                unlock_cpu_and_check_preemption(lock);
            }
            ThreadSt::Blocked => {
                thread.base_priority.replace(&mut *lock, priority);
                thread.priority.replace(&mut *lock, priority);
                wait::reorder_wait(lock.borrow_mut(), thread);
            }
            ThreadSt::Terminated => return Err(SetThreadPriorityError::BadObjectState),
        }
        Ok(())
    }

    /// Pass the processor to the next thread of the caller's priority.
    ///
    /// Rotates the caller's priority list so its FIFO successor (if any)
    /// becomes the head, reloads the caller's quantum, and requests a
    /// reschedule.
    pub fn thread_yield() -> Result<(), YieldThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if state::exec_state::<Traits>(lock.borrow_mut()) != ExecState::Running {
            return Err(YieldThreadError::BadContext);
        }
        let state = Traits::state();
        let cur = state
            .running_thread(lock.borrow_mut())
            .ok_or(YieldThreadError::BadContext)?;

        if state.ready_array.has_peer(lock.borrow_mut(), cur) {
            let reload = cur.quantum_reload.get(&*lock);
            cur.quantum.replace(&mut *lock, reload);
            let priority = cur.priority.get(&*lock);

            // Safety: The running thread is linked in the ready array
            let new_head = unsafe { state.ready_array.rotate(lock.borrow_mut(), priority) };

            let pending = state.pending_thread.get(&*lock);
            if pending.map_or(false, |p| core::ptr::eq(p, cur)) {
                state.pending_thread.replace(&mut *lock, new_head);
            }
        }

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Insert the thread into the ready array at its current priority and update
/// the pending selection if the newcomer out-prioritizes it.
///
/// # Safety
///
/// The thread must not be linked into any queue.
pub(super) unsafe fn enqueue_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let state = Traits::state();

    // Safety: Upheld by the caller
    unsafe { state.ready_array.push_back(lock.borrow_mut(), thread) };
    tick::note_ready_insert(lock.borrow_mut(), thread);

    if let Some(pending) = state.pending_thread.get(&*lock) {
        if thread.priority.get(&*lock) > pending.priority.get(&*lock) {
            state.pending_thread.replace(&mut *lock, Some(thread));
        }
    }
}

/// Transition the thread into the Ready state and enqueue it.
///
/// # Safety
///
/// The thread must not be linked into any queue, and its execution context
/// must be valid (a Terminated thread needs `initialize_thread_state`
/// first).
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    thread.st.replace(&mut *lock, ThreadSt::Ready);
    // Safety: Upheld by the caller
    unsafe { enqueue_ready(lock, thread) };
}

/// Unlink the thread from the ready array. The pending selection is cleared
/// when it pointed at this thread or at the running thread, forcing the next
/// reschedule to re-select.
///
/// # Safety
///
/// The thread must be linked in the ready array.
pub(super) unsafe fn make_unready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let state = Traits::state();

    tick::note_ready_remove(lock.borrow_mut(), thread);
    // Safety: Upheld by the caller
    unsafe { state.ready_array.remove(lock.borrow_mut(), thread) };

    let points_here = |t: Option<&'static ThreadCb<Traits>>| {
        t.map_or(false, |t| core::ptr::eq(t, thread))
    };
    if points_here(state.running_thread.get(&*lock))
        || points_here(state.pending_thread.get(&*lock))
    {
        state.pending_thread.replace(&mut *lock, None);
    }
}

/// Resolve the pending selection, consulting the ready array when it was
/// cleared.
fn resolve_pending<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<&'static ThreadCb<Traits>> {
    let state = Traits::state();
    if let Some(pending) = state.pending_thread.get(&*lock) {
        return Some(pending);
    }
    let front = state.ready_array.front(lock.borrow_mut());
    state.pending_thread.replace(&mut *lock, front);
    front
}

/// Re-run the dispatch decision and request a context switch if the pending
/// thread differs from the running one.
///
/// Only acts in the Running state: under the scheduler lock the decision is
/// deferred to `lock_exit`, and in interrupt states to the outermost ISR
/// epilogue.
pub(super) fn reschedule<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if state::exec_state::<Traits>(lock.borrow_mut()) != ExecState::Running {
        return;
    }

    let running = Traits::state().running_thread(lock.borrow_mut());
    let Some(pending) = resolve_pending(lock.borrow_mut()) else {
        return;
    };

    if running.map_or(true, |r| !core::ptr::eq(r, pending)) {
        // Safety: Interrupt mask raised; we are the kernel
        unsafe { Traits::request_context_switch() };
    }
}

/// Re-run the dispatch decision, then relinquish the interrupt-masking lock.
/// The port takes the requested switch (if any) at the moment the mask
/// drops.
///
/// Operations that make a thread Ready call this before returning to the
/// caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    reschedule::<Traits>(lock.borrow_mut());
    drop(lock);
}

/// The software side of a context switch; see
/// [`PortToKernel::commit_context_switch`](crate::PortToKernel::commit_context_switch).
pub(super) fn commit_context_switch<Traits: KernelTraits>() -> Option<CompletedSwitch<Traits>> {
    // The port calls this outside any kernel critical section
    let mut lock = klock::lock_cpu::<Traits>()
        .expect("context switch committed while the interrupt mask was raised");
    let state = Traits::state();

    // No switch completes while the scheduler lock is held
    debug_assert_eq!(state.lock_count.get(&*lock), 0);

    let prev = state.running_thread.get(&*lock);
    let next = resolve_pending(lock.borrow_mut())?;

    if prev.map_or(false, |p| core::ptr::eq(p, next)) {
        return None;
    }

    // The outgoing thread loses the processor but keeps its place in the
    // ready array, unless it blocked or terminated
    if let Some(prev) = prev {
        if prev.st.get(&*lock) == ThreadSt::Running {
            prev.st.replace(&mut *lock, ThreadSt::Ready);
        }
    }

    debug_assert_eq!(next.st.get(&*lock), ThreadSt::Ready);
    next.st.replace(&mut *lock, ThreadSt::Running);
    state.running_thread.replace(&mut *lock, Some(next));
    state.pending_thread.replace(&mut *lock, Some(next));

    if let Some(hook) = Traits::CONTEXT_SWITCH_HOOK {
        hook(prev, next);
    }

    Some(CompletedSwitch {
        from: prev,
        to: next,
    })
}
