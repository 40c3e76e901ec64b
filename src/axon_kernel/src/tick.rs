//! The system tick: round-robin slicing and the adaptive tick source.
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state::{self, ExecState},
    thread::readyqueue::Queue as _,
    timeout,
    utils::Init,
    KernelTraits, PortThreading, System, ThreadCb,
};

/// Bookkeeping for the tick source.
///
/// The tick interrupt is needed exactly while someone consumes ticks: each
/// pending timeout holds one user, and - when round-robin is enabled - so
/// does each priority level holding more than one runnable thread. With
/// [`KernelCfg::ADAPTIVE_TICK`](crate::KernelCfg::ADAPTIVE_TICK), a user
/// count of zero silences the tick interrupt entirely.
pub(crate) struct TickSource<Traits: PortThreading> {
    users: CpuLockCell<Traits, u32>,

    /// Whether the tick interrupt is currently unmasked.
    enabled: CpuLockCell<Traits, bool>,

    /// Whether `tick_init` has run.
    started: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TickSource<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        users: Init::INIT,
        enabled: Init::INIT,
        started: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TickSource<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TickSource")
            .field("users", &self.users)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Register a consumer of ticks.
pub(crate) fn source_acquire<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let source = &Traits::state().tick_source;
    let users = source.users.get(&*lock);
    source.users.replace(&mut *lock, users + 1);
    evaluate::<Traits>(lock);
}

/// Unregister a consumer of ticks.
pub(crate) fn source_release<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let source = &Traits::state().tick_source;
    let users = source.users.get(&*lock);
    debug_assert!(users > 0);
    source.users.replace(&mut *lock, users.saturating_sub(1));
    evaluate::<Traits>(lock);
}

/// Reconcile the tick interrupt mask with the user count.
fn evaluate<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if !Traits::ADAPTIVE_TICK {
        return;
    }

    let source = &Traits::state().tick_source;
    if !source.started.get(&*lock) {
        return;
    }

    let want = source.users.get(&*lock) != 0;
    if want != source.enabled.get(&*lock) {
        source.enabled.replace(&mut *lock, want);
        // Safety: `tick_init` has run (checked above)
        unsafe {
            if want {
                Traits::tick_enable();
            } else {
                Traits::tick_disable();
            }
        }
    }
}

/// Arm the tick source during kernel startup.
pub(crate) fn start_source<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let source = &Traits::state().tick_source;

    // Safety: Called once, from `begin_scheduling`
    unsafe { Traits::tick_init() };
    source.started.replace(&mut *lock, true);
    source.enabled.replace(&mut *lock, true);

    // With no consumers yet, an adaptive tick goes right back to sleep
    evaluate::<Traits>(lock);
}

/// Called right after a thread entered the ready array: a list that grew to
/// two threads starts needing round-robin ticks.
pub(crate) fn note_ready_insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if Traits::ROUND_ROBIN_QUANTUM == 0 {
        return;
    }
    if Traits::state()
        .ready_array
        .is_pair(lock.borrow_mut(), thread)
    {
        source_acquire::<Traits>(lock);
    }
}

/// Called right before a thread leaves the ready array: a list about to
/// shrink to one thread stops needing round-robin ticks.
pub(crate) fn note_ready_remove<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if Traits::ROUND_ROBIN_QUANTUM == 0 {
        return;
    }
    if Traits::state()
        .ready_array
        .is_pair(lock.borrow_mut(), thread)
    {
        source_release::<Traits>(lock);
    }
}

/// The per-tick round-robin step.
///
/// Decrements the running thread's quantum when it shares its priority level
/// with another runnable thread; at zero, reloads the quantum and rotates
/// the level so the FIFO successor becomes pending. Under the scheduler lock
/// the rotation is deferred to `lock_exit` instead.
fn round_robin_step<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if Traits::ROUND_ROBIN_QUANTUM == 0 {
        return;
    }

    match state::exec_state::<Traits>(lock.borrow_mut()) {
        ExecState::Running | ExecState::IsrRunning => {}
        ExecState::Locked | ExecState::IsrLocked => {
            Traits::state().deferred_rotation.replace(&mut *lock, true);
            return;
        }
        ExecState::Inactive | ExecState::Init => return,
    }

    let state = Traits::state();
    let Some(cur) = state.running_thread(lock.borrow_mut()) else {
        return;
    };
    if !state.ready_array.has_peer(lock.borrow_mut(), cur) {
        return;
    }

    let quantum = cur.quantum.get(&*lock).saturating_sub(1);
    cur.quantum.replace(&mut *lock, quantum);

    if quantum == 0 {
        let reload = cur.quantum_reload.get(&*lock);
        cur.quantum.replace(&mut *lock, reload);
        rotate_running_level(lock, cur);
    }
}

/// Rotate the running thread's priority level and make the new head pending,
/// unless something else already took over the pending selection.
fn rotate_running_level<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cur: &'static ThreadCb<Traits>,
) {
    let state = Traits::state();
    let priority = cur.priority.get(&*lock);

    // Safety: The running thread is linked in the ready array
    let new_head = unsafe { state.ready_array.rotate(lock.borrow_mut(), priority) };

    let pending = state.pending_thread.get(&*lock);
    if pending.map_or(false, |p| core::ptr::eq(p, cur)) {
        state.pending_thread.replace(&mut *lock, new_head);
    }
}

/// Replay one round-robin rotation missed while the scheduler was locked.
/// Called by `lock_exit` when the lock count returns to zero.
pub(crate) fn replay_deferred_rotation<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();

    if !state.deferred_rotation.replace(&mut *lock, false) {
        return;
    }
    if Traits::ROUND_ROBIN_QUANTUM == 0 {
        return;
    }

    let Some(cur) = state.running_thread(lock.borrow_mut()) else {
        return;
    };
    if !state.ready_array.has_peer(lock.borrow_mut(), cur) {
        return;
    }

    let reload = cur.quantum_reload.get(&*lock);
    cur.quantum.replace(&mut *lock, reload);
    rotate_running_level(lock, cur);
}

impl<Traits: KernelTraits> System<Traits> {
    /// The body of the system tick interrupt handler.
    ///
    /// Must be called from the tick interrupt only. Performs the whole tick
    /// sequence: ISR prologue, tick hook, round-robin step, timer-wheel
    /// step, ISR epilogue. A context switch decided along the way is taken
    /// by the port when the interrupt returns.
    pub fn tick_handler() {
        Self::isr_prologue();

        if let Some(hook) = Traits::TICK_HOOK {
            hook();
        }

        // The tick interrupt runs with the mask at its base level, so the
        // lock is available
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        round_robin_step::<Traits>(lock.borrow_mut());
        lock = timeout::handle_tick::<Traits>(lock);
        drop(lock);

        Self::isr_epilogue();
    }
}
