#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
use core::{fmt, marker::PhantomData};

pub mod error;
mod klock;
mod semaphore;
mod startup;
mod state;
mod thread;
mod tick;
mod timeout;
mod timer;
mod wait;

mod cfg;

pub mod utils;

pub use self::{
    semaphore::SemaphoreCb,
    thread::{ThreadCb, ThreadSt, IDLE_PRIORITY},
    timer::{TimerCb, TimerFlags},
};

#[doc(hidden)]
pub use self::thread::readyqueue;

use self::{klock::CpuLockCell, utils::Init};

/// Unsigned integer type representing a number of system ticks.
pub type UTicks = u32;

/// The largest tick count. Reserved for the timer wheel's sentinel; no
/// real timeout carries this delta.
pub const TICK_MAX: UTicks = UTicks::MAX;

/// Implemented by a port, this trait provides the operations the kernel
/// needs from the target processor: interrupt masking, context-switch
/// machinery, and stack construction.
///
/// # Safety
///
/// The implementation must uphold each method's contract; the kernel builds
/// its memory-safety argument on them.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-thread state embedded at the beginning of each
    /// [`ThreadCb`]. The saved stack pointer of a suspended thread lives
    /// here, at a location known to the port's context-switch code.
    type PortThreadState: Send + Sync + fmt::Debug + Init + 'static;

    /// A saved interrupt priority mask, as returned by
    /// [`raise_int_mask`](Self::raise_int_mask).
    type IntMask: Copy + Send + 'static;

    /// The smallest stack size (in bytes) accepted by
    /// [`initialize_thread_state`](Self::initialize_thread_state).
    const STACK_MIN_SIZE: usize;

    /// The required stack alignment.
    const STACK_ALIGN: usize;

    /// Atomically raise the interrupt priority mask to the kernel ceiling,
    /// returning the previous mask. Kernel-level interrupts are blocked
    /// while the mask is raised; strictly higher-priority (NMI-class)
    /// interrupts stay alive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn raise_int_mask() -> Self::IntMask;

    /// Restore a mask previously captured by
    /// [`raise_int_mask`](Self::raise_int_mask). With the mask back at its
    /// base level, the port must take any pending context switch.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with a value captured by the
    /// matching `raise_int_mask`.
    unsafe fn restore_int_mask(prev: Self::IntMask);

    /// Get a flag indicating whether the mask is currently raised to the
    /// kernel ceiling.
    fn is_int_mask_raised() -> bool;

    /// Flag a context switch to the pending thread. The switch is taken at
    /// the next instruction boundary where the mask is at its base level and
    /// no interrupt handler is active, by calling
    /// [`PortToKernel::commit_context_switch`] and swapping the thread
    /// contexts. Idempotent.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with the mask raised.
    unsafe fn request_context_switch();

    /// Start multithreading by popping the synthetic frame of the specified
    /// thread. Never returns.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, once, from [`System::start`].
    unsafe fn start_first_thread(thread: &'static ThreadCb<Self>) -> !;

    /// Write a synthetic frame to the given stack so that the first switch
    /// into the thread enters `entry(param)` with interrupts enabled, and
    /// record the resulting top-of-stack in the thread's
    /// [`port_state`](ThreadCb::port_state). If `entry` returns, the thread
    /// must fall through to the kernel's thread-exit path.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel while the thread is not live.
    /// `stack_base .. stack_base + stack_size` must be a valid, writable,
    /// suitably aligned region owned by the caller.
    unsafe fn initialize_thread_state(
        thread: &'static ThreadCb<Self>,
        entry: fn(usize),
        param: usize,
        stack_base: *mut u8,
        stack_size: usize,
    );

    /// Get a flag indicating whether an interrupt handler is currently
    /// executing.
    fn is_interrupt_context() -> bool;

    /// Get a flag indicating whether the currently executing interrupt
    /// handler is the outermost one.
    fn is_last_interrupt() -> bool;

    /// Hint that the processor has nothing to do. Called repeatedly from the
    /// idle thread; a typical implementation issues a wait-for-interrupt
    /// instruction.
    ///
    /// # Safety
    ///
    /// Only meant to be called from the idle thread's loop.
    unsafe fn on_idle_processor() {}
}

/// Implemented by a port, this trait controls the periodic tick source that
/// drives round-robin scheduling and the timer wheel.
///
/// # Safety
///
/// See [`PortThreading`].
pub unsafe trait PortTimer: PortThreading {
    /// Configure and arm the periodic tick source. The tick interrupt
    /// handler must call [`System::tick_handler`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, once, during startup.
    unsafe fn tick_init();

    /// Unmask the tick interrupt.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, after `tick_init`.
    unsafe fn tick_enable();

    /// Mask the tick interrupt. Used to silence the tick when no timeout is
    /// pending and no round-robin slicing is needed.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, after `tick_init`.
    unsafe fn tick_disable();
}

/// The static configuration of a kernel instantiation. Implemented by the
/// [`configure_kernel!`](crate::configure_kernel) macro.
pub trait KernelCfg: PortThreading + PortTimer {
    /// The number of priority levels, including the reserved idle level.
    /// Range `3..=256`. Scheduler selection is O(1) regardless.
    const PRIORITY_LEVELS: usize;

    /// The round-robin time slice in ticks. `0` disables round-robin
    /// scheduling; threads then run until they yield or block.
    const ROUND_ROBIN_QUANTUM: UTicks;

    /// When enabled, the tick interrupt is silenced whenever no timeout is
    /// pending and no priority level holds more than one ready thread.
    const ADAPTIVE_TICK: bool;

    /// Called after the next thread has been selected and before the actual
    /// switch. The first argument is `None` on the very first dispatch.
    const CONTEXT_SWITCH_HOOK: Option<ContextSwitchHookFn<Self>>;

    /// Called first thing in the tick handler.
    const TICK_HOOK: Option<fn()>;

    /// Called from the idle thread's loop.
    const IDLE_HOOK: Option<fn()>;

    /// The ready-array type, instantiated for `PRIORITY_LEVELS`.
    type ReadyArray: readyqueue::Queue<Self>;

    /// The kernel-state singleton for this instantiation.
    fn state() -> &'static KernelState<Self>;

    /// The stack region for the built-in idle thread.
    fn idle_stack() -> (*mut u8, usize);
}

/// Signature of [`KernelCfg::CONTEXT_SWITCH_HOOK`].
pub type ContextSwitchHookFn<Traits> =
    fn(Option<&'static ThreadCb<Traits>>, &'static ThreadCb<Traits>);

/// The complete trait family of a kernel instantiation. Blanket-implemented
/// for every type satisfying the bounds.
pub trait KernelTraits: KernelCfg {}
impl<T: KernelCfg> KernelTraits for T {}

/// The global state of a kernel instantiation.
///
/// One instance per instantiation, generated by
/// [`configure_kernel!`](crate::configure_kernel). All mutable fields are
/// gated behind the interrupt-masking lock.
pub struct KernelState<Traits: KernelCfg> {
    /// The thread that currently holds the processor.
    pub(crate) running_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The thread selected to run on the next context switch. May equal
    /// `running_thread`; `None` means "re-select from the ready array".
    pub(crate) pending_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    pub(crate) exec_state: CpuLockCell<Traits, state::ExecState>,

    /// Nesting depth of the scheduler lock.
    pub(crate) lock_count: CpuLockCell<Traits, u32>,

    /// Nesting depth of kernel-level interrupt handlers, maintained by the
    /// ISR prologue/epilogue.
    pub(crate) isr_nesting: CpuLockCell<Traits, u32>,

    /// Set when a round-robin slice boundary passed while the scheduler was
    /// locked; `lock_exit` replays one rotation.
    pub(crate) deferred_rotation: CpuLockCell<Traits, bool>,

    pub(crate) ready_array: Traits::ReadyArray,

    pub(crate) timeouts: timeout::TimeoutGlobals<Traits>,

    pub(crate) tick_source: tick::TickSource<Traits>,

    /// The built-in idle thread, runnable at [`IDLE_PRIORITY`] whenever
    /// every application thread is blocked.
    pub(crate) idle_thread: ThreadCb<Traits>,
}

impl<Traits: KernelTraits> Init for KernelState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_thread: Init::INIT,
        pending_thread: Init::INIT,
        exec_state: Init::INIT,
        lock_count: Init::INIT,
        isr_nesting: Init::INIT,
        deferred_rotation: Init::INIT,
        ready_array: Init::INIT,
        timeouts: Init::INIT,
        tick_source: Init::INIT,
        idle_thread: Init::INIT,
    };
}

impl<Traits: KernelTraits> KernelState<Traits> {
    /// Get the running thread.
    pub(crate) fn running_thread(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.running_thread.get(&*lock)
    }
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("exec_state", &self.exec_state)
            .field("lock_count", &self.lock_count)
            .field("isr_nesting", &self.isr_nesting)
            .field("ready_array", &self.ready_array)
            .finish_non_exhaustive()
    }
}

/// The public interface of a kernel instantiation.
///
/// All kernel operations are associated functions of this type,
/// parameterized by the instantiation's trait type.
pub struct System<Traits>(PhantomData<Traits>);

/// The kernel-side interface used by ports.
///
/// Blanket-implemented for every kernel instantiation; ports call these
/// methods from their startup code and context-switch handler.
///
/// # Safety
///
/// Only meant to be implemented by this crate.
pub unsafe trait PortToKernel: KernelTraits {
    /// Transition the kernel into the Running state and select the first
    /// thread to run. Called once, either by [`System::start`] or by a
    /// hosted port's boot path.
    ///
    /// # Safety
    ///
    /// Must follow a successful [`System::init`]; the interrupt mask must be
    /// at its base level.
    unsafe fn begin_scheduling();

    /// Perform the software side of a context switch: demote the outgoing
    /// thread, promote the pending thread to Running, and run the
    /// context-switch hook. Returns `None` when no switch is needed after
    /// all; otherwise the port must save the outgoing context and restore
    /// the incoming one.
    ///
    /// # Safety
    ///
    /// Only meant to be called from the port's context-switch path, with the
    /// interrupt mask at its base level and no kernel critical section
    /// active.
    unsafe fn commit_context_switch() -> Option<CompletedSwitch<Self>>;
}

// Safety: This crate is the kernel
unsafe impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn begin_scheduling() {
        startup::begin_scheduling::<Traits>();
    }

    unsafe fn commit_context_switch() -> Option<CompletedSwitch<Traits>> {
        thread::commit_context_switch::<Traits>()
    }
}

/// The outcome of [`PortToKernel::commit_context_switch`]: the thread losing
/// the processor (if any) and the thread receiving it.
pub struct CompletedSwitch<Traits: PortThreading> {
    pub from: Option<&'static ThreadCb<Traits>>,
    pub to: &'static ThreadCb<Traits>,
}

impl<Traits: PortThreading> fmt::Debug for CompletedSwitch<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompletedSwitch")
            .field("from", &self.from.map(|t| t as *const _))
            .field("to", &(self.to as *const _))
            .finish()
    }
}
