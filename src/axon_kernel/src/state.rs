//! The kernel execution state machine, the scheduler lock, and the
//! interrupt prologue/epilogue.
use crate::{
    error::{BadContextError, SchedulerLockError},
    klock::{self, CpuLockTokenRefMut},
    thread, tick,
    utils::Init,
    KernelTraits, System,
};

/// Kernel execution state machine
///
/// ```text
/// Inactive → Init → Running ⇄ Locked
///                      ⇅         ⇅
///                  IsrRunning ⇄ IsrLocked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecState {
    /// Before `init`.
    Inactive,
    /// After `init`, before `start`.
    Init,
    /// Multithreading in progress.
    Running,
    /// The scheduler lock is held by a thread.
    Locked,
    /// A kernel-level interrupt handler is executing.
    IsrRunning,
    /// A kernel-level interrupt handler is executing and the scheduler lock
    /// is held.
    IsrLocked,
}

impl Init for ExecState {
    const INIT: Self = Self::Inactive;
}

pub(crate) fn exec_state<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> ExecState {
    Traits::state().exec_state.get(&*lock)
}

/// If the current context can block - a running thread, outside interrupt
/// handlers, scheduler unlocked - return `Ok(())`.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), BadContextError> {
    match exec_state::<Traits>(lock.borrow_mut()) {
        ExecState::Running => {
            debug_assert!(!Traits::is_interrupt_context());
            Ok(())
        }
        _ => Err(BadContextError::BadContext),
    }
}

/// These associated functions implement the scheduler lock and the interrupt
/// nesting protocol.
impl<Traits: KernelTraits> System<Traits> {
    /// Enter the scheduler lock.
    ///
    /// Scheduling decisions are deferred until the matching [`lock_exit`];
    /// interrupts stay enabled throughout. The lock counts, so nested pairs
    /// compose.
    ///
    /// [`lock_exit`]: Self::lock_exit
    pub fn lock_enter() -> Result<(), SchedulerLockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state();

        let next = match exec_state::<Traits>(lock.borrow_mut()) {
            ExecState::Running | ExecState::Locked => ExecState::Locked,
            ExecState::IsrRunning | ExecState::IsrLocked => ExecState::IsrLocked,
            ExecState::Inactive | ExecState::Init => {
                return Err(SchedulerLockError::BadContext)
            }
        };
        state.exec_state.replace(&mut *lock, next);

        let count = state.lock_count.get(&*lock);
        state.lock_count.replace(&mut *lock, count + 1);
        Ok(())
    }

    /// Leave the scheduler lock.
    ///
    /// When the count returns to zero, a round-robin rotation missed under
    /// the lock is replayed and the deferred scheduling decision runs; a
    /// resulting context switch is taken as the interrupt mask is restored.
    pub fn lock_exit() -> Result<(), SchedulerLockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state();

        match exec_state::<Traits>(lock.borrow_mut()) {
            ExecState::Locked => {
                let count = state.lock_count.get(&*lock);
                debug_assert!(count > 0);
                state.lock_count.replace(&mut *lock, count - 1);

                if count == 1 {
                    state.exec_state.replace(&mut *lock, ExecState::Running);
                    tick::replay_deferred_rotation::<Traits>(lock.borrow_mut());
                    thread::reschedule::<Traits>(lock.borrow_mut());
                }
            }
            ExecState::IsrLocked => {
                let count = state.lock_count.get(&*lock);
                debug_assert!(count > 0);
                state.lock_count.replace(&mut *lock, count - 1);

                if count == 1 {
                    // The deferred decision belongs to the outermost ISR
                    // epilogue, not to us
                    state.exec_state.replace(&mut *lock, ExecState::IsrRunning);
                }
            }
            _ => return Err(SchedulerLockError::BadContext),
        }
        Ok(())
    }

    /// Mark the entry of a kernel-level interrupt handler.
    ///
    /// Every kernel-level interrupt handler must call this before using any
    /// other kernel operation and pair it with [`isr_epilogue`].
    ///
    /// [`isr_epilogue`]: Self::isr_epilogue
    pub fn isr_prologue() {
        // Kernel-level interrupts are masked while the interrupt-masking
        // lock is held, so the mask is at its base level on handler entry
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let state = Traits::state();

        let exec = exec_state::<Traits>(lock.borrow_mut());
        debug_assert!(
            !matches!(exec, ExecState::Inactive),
            "interrupt taken before kernel initialization"
        );

        let count = state.isr_nesting.get(&*lock);
        state.isr_nesting.replace(&mut *lock, count + 1);

        let next = match exec {
            ExecState::Running | ExecState::IsrRunning => ExecState::IsrRunning,
            ExecState::Locked | ExecState::IsrLocked => ExecState::IsrLocked,
            other => other,
        };
        state.exec_state.replace(&mut *lock, next);
    }

    /// Mark the exit of a kernel-level interrupt handler.
    ///
    /// On the outermost exit, the thread to run is re-selected; the port's
    /// return-from-interrupt path performs the switch.
    pub fn isr_epilogue() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let state = Traits::state();

        let count = state.isr_nesting.get(&*lock);
        debug_assert!(count > 0, "unmatched `isr_epilogue`");
        state.isr_nesting.replace(&mut *lock, count.saturating_sub(1));

        if Traits::is_last_interrupt() {
            let next = match exec_state::<Traits>(lock.borrow_mut()) {
                ExecState::IsrRunning => ExecState::Running,
                ExecState::IsrLocked => ExecState::Locked,
                other => other,
            };
            state.exec_state.replace(&mut *lock, next);

            // No switch while the scheduler lock is held; `lock_exit` will
            // pick up the decision
            thread::reschedule::<Traits>(lock.borrow_mut());
        }
    }
}
