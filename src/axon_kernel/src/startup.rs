//! Kernel startup and the built-in idle thread.
use crate::{
    error::InitKernelError,
    klock,
    state::{self, ExecState},
    thread::{self, readyqueue::Queue as _, ThreadSt, IDLE_PRIORITY, THREAD_SIGNATURE},
    tick, timeout, KernelTraits, PortToKernel, System,
};

/// These associated functions implement the kernel lifecycle operations.
impl<Traits: KernelTraits> System<Traits> {
    /// Initialize the kernel: link up the timer wheel and create the
    /// built-in idle thread. Must be called exactly once, before
    /// [`start`](Self::start) and before any other kernel operation.
    pub fn init() -> Result<(), InitKernelError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state();

        if state::exec_state::<Traits>(lock.borrow_mut()) != ExecState::Inactive {
            return Err(InitKernelError::BadContext);
        }

        timeout::init_wheel::<Traits>(lock.borrow_mut());

        // The idle thread occupies the reserved lowest priority, so the
        // ready array is never empty once the scheduler starts
        let idle = &state.idle_thread;
        let (stack_base, stack_size) = Traits::idle_stack();
        debug_assert!(stack_size >= Traits::STACK_MIN_SIZE);

        // Safety: The idle thread is not live yet, and the configuration
        //         macro owns the stack region
        unsafe {
            Traits::initialize_thread_state(idle, idle_loop::<Traits>, 0, stack_base, stack_size)
        };

        idle.base_priority.replace(&mut *lock, IDLE_PRIORITY);
        idle.priority.replace(&mut *lock, IDLE_PRIORITY);
        idle.quantum_reload
            .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
        idle.quantum
            .replace(&mut *lock, Traits::ROUND_ROBIN_QUANTUM);
        idle.wait.reset(lock.borrow_mut());
        idle.signature.replace(&mut *lock, THREAD_SIGNATURE);

        // Safety: The idle thread is not in any queue, and its context was
        //         just initialized
        unsafe { thread::make_ready(lock.borrow_mut(), idle) };

        state.exec_state.replace(&mut *lock, ExecState::Init);
        Ok(())
    }

    /// Start the scheduler and dispatch the first thread. Never returns.
    pub fn start() -> ! {
        // Safety: We are the kernel; the mask is at its base level
        unsafe { <Traits as PortToKernel>::begin_scheduling() };

        let first = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            // `begin_scheduling` selected the first thread
            Traits::state().running_thread(lock.borrow_mut()).unwrap()
        };

        // Safety: Scheduling has commenced and `first` is the Running thread
        unsafe { Traits::start_first_thread(first) }
    }
}

/// Implements [`PortToKernel::begin_scheduling`].
pub(super) fn begin_scheduling<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let state = Traits::state();

    assert_eq!(
        state::exec_state::<Traits>(lock.borrow_mut()),
        ExecState::Init,
        "`start` requires a previous `init`"
    );

    // At least the idle thread is runnable
    let first = state.ready_array.front(lock.borrow_mut()).unwrap();

    first.st.replace(&mut *lock, ThreadSt::Running);
    state.running_thread.replace(&mut *lock, Some(first));
    state.pending_thread.replace(&mut *lock, Some(first));

    tick::start_source::<Traits>(lock.borrow_mut());

    state.exec_state.replace(&mut *lock, ExecState::Running);
}

/// The body of the built-in idle thread. Never blocks, so the dispatcher
/// always has somewhere to go.
fn idle_loop<Traits: KernelTraits>(_: usize) {
    loop {
        if let Some(hook) = Traits::IDLE_HOOK {
            hook();
        }
        // Safety: Idle thread context, interrupts enabled
        unsafe { Traits::on_idle_processor() };
    }
}
