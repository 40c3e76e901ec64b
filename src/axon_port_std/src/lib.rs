//! Simulation environment for running Axon on a hosted environment.
//!
//! This port models the target processor as deterministic scheduler
//! bookkeeping: the interrupt priority mask is a flag, interrupts are entry
//! points driven by the harness ([`tick`], [`raise_isr`]), and a requested
//! context switch is committed at the exact boundary where real hardware
//! would take it - the moment the mask drops back to its base level with no
//! interrupt handler active. No host threads and no stack swapping are
//! involved, so every test run is repeatable and cannot deadlock.
//!
//! The trade-off is that simulated threads never execute their entry
//! functions. A blocking call issued by the harness returns immediately with
//! the thread left in the Blocked state; the harness observes the outcome
//! (who is Running, who became Ready, whether the wait timed out) through
//! the kernel's introspection API instead of from inside the thread.
//!
//! # Usage
//!
//! ```rust,ignore
//! axon_port_std::use_port!(unsafe struct SystemTraits);
//! axon_kernel::configure_kernel! {
//!     unsafe impl KernelCfg for SystemTraits {
//!         priority_levels: 16,
//!         round_robin_quantum: 2,
//!         idle_stack_size: 4096,
//!     }
//! }
//!
//! type System = axon_kernel::System<SystemTraits>;
//!
//! System::init().unwrap();
//! System::thread_init(&THREAD_A, entry, 0, axon_port_std::alloc_stack(512), 512, 5).unwrap();
//! axon_port_std::boot::<SystemTraits>();
//! axon_port_std::tick::<SystemTraits>();
//! ```
use std::sync::atomic::{AtomicBool, Ordering};

use axon_kernel::{utils::Init, PortToKernel, ThreadCb};
use spin::Mutex as SpinMutex;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate axon_kernel;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    axon_kernel::KernelTraits + axon_kernel::PortThreading<PortThreadState = ThreadState>
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of `PortThreading`/`PortTimer`.
#[doc(hidden)]
pub struct State {
    sched: SpinMutex<SimSched>,
}

#[derive(Debug)]
struct SimSched {
    /// Whether the interrupt priority mask is raised to the kernel ceiling.
    int_mask: bool,
    /// A context switch was requested and not yet committed.
    switch_pending: bool,
    /// Nesting depth of simulated interrupt handlers.
    isr_depth: u32,
    /// `boot` has run; committing switches is meaningful.
    started: bool,
    /// `tick_init` has run.
    tick_armed: bool,
    /// The tick interrupt is unmasked.
    tick_enabled: bool,
    /// Committed context switches since boot.
    switch_count: u64,
}

/// The port-side state of a simulated thread.
#[derive(Debug)]
pub struct ThreadState {
    /// Set by `initialize_thread_state`; a thread must be initialized before
    /// it can be dispatched.
    initialized: AtomicBool,
}

impl Init for ThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        initialized: AtomicBool::new(false),
    };
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: SpinMutex::new(SimSched {
                int_mask: false,
                switch_pending: false,
                isr_depth: 0,
                started: false,
                tick_armed: false,
                tick_enabled: false,
                switch_count: 0,
            }),
        }
    }

    pub unsafe fn raise_int_mask(&self) -> bool {
        let mut sched = self.sched.lock();
        let prev = sched.int_mask;
        sched.int_mask = true;
        prev
    }

    pub unsafe fn restore_int_mask<Traits: PortInstance>(&'static self, prev: bool) {
        {
            let mut sched = self.sched.lock();
            sched.int_mask = prev;
        }
        if !prev {
            // The mask just dropped to its base level; this is where the
            // hardware takes a pended context switch
            self.dispatch_pending::<Traits>();
        }
    }

    pub fn is_int_mask_raised(&self) -> bool {
        self.sched.lock().int_mask
    }

    pub unsafe fn request_context_switch(&self) {
        log::trace!("request_context_switch");
        self.sched.lock().switch_pending = true;
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static ThreadCb<Traits>,
        entry: fn(usize),
        param: usize,
        stack_base: *mut u8,
        stack_size: usize,
    ) {
        log::trace!(
            "initialize_thread_state({:p}, entry = {:p}, param = {}, stack = {:p}+{})",
            thread,
            entry as *const (),
            param,
            stack_base,
            stack_size,
        );
        // A real port would write a synthetic frame to the stack here. The
        // simulation only records that the context exists.
        thread.port_state.initialized.store(true, Ordering::Relaxed);
    }

    pub unsafe fn tick_init(&self) {
        log::trace!("tick_init");
        let mut sched = self.sched.lock();
        sched.tick_armed = true;
        sched.tick_enabled = true;
    }

    pub unsafe fn tick_enable(&self) {
        log::trace!("tick_enable");
        let mut sched = self.sched.lock();
        debug_assert!(sched.tick_armed);
        sched.tick_enabled = true;
    }

    pub unsafe fn tick_disable(&self) {
        log::trace!("tick_disable");
        let mut sched = self.sched.lock();
        debug_assert!(sched.tick_armed);
        sched.tick_enabled = false;
    }

    pub fn is_interrupt_context(&self) -> bool {
        self.sched.lock().isr_depth > 0
    }

    pub fn is_last_interrupt(&self) -> bool {
        self.sched.lock().isr_depth == 1
    }

    /// Commit pending context switches while the mask is at its base level
    /// and no simulated interrupt handler is active.
    fn dispatch_pending<Traits: PortInstance>(&'static self) {
        loop {
            {
                let mut sched = self.sched.lock();
                if sched.int_mask
                    || sched.isr_depth != 0
                    || !sched.started
                    || !sched.switch_pending
                {
                    return;
                }
                sched.switch_pending = false;
            }

            // Safety: The mask is at its base level and no kernel critical
            //         section is active (we are the port's switch handler)
            if let Some(switch) = unsafe { <Traits as PortToKernel>::commit_context_switch() } {
                debug_assert!(switch.to.port_state.initialized.load(Ordering::Relaxed));
                log::trace!("dispatched {:p} -> {:p}", switch.from.unwrap_or(switch.to), switch.to);
                self.sched.lock().switch_count += 1;
            }
        }
    }
}

/// Transition the kernel into the Running state and let the simulation
/// dispatch threads. The harness-side replacement for the diverging
/// `System::start`.
///
/// Call after `System::init` and the initial `thread_init` calls.
pub fn boot<Traits: PortInstance>() {
    // The harness may already have installed a logger
    let _ = env_logger::builder().is_test(true).try_init();
    log::trace!("boot");

    // Safety: We are the port
    unsafe { <Traits as PortToKernel>::begin_scheduling() };
    Traits::port_state().sched.lock().started = true;
}

/// Deliver one tick interrupt: runs `System::tick_handler` in a simulated
/// interrupt context, then takes any resulting context switch, exactly as
/// the return-from-interrupt path would.
///
/// Ticks raised while the tick source is disabled (see
/// `KernelCfg::ADAPTIVE_TICK`) are delivered anyway; a masked tick interrupt
/// would simply not fire on real hardware, so tests normally check
/// [`is_tick_enabled`] before calling this when exercising the adaptive
/// tick.
pub fn tick<Traits: PortInstance>() {
    raise_isr::<Traits, _>(|| axon_kernel::System::<Traits>::tick_handler());
}

/// Run `body` in a simulated kernel-level interrupt context, then take any
/// pending context switch on the outermost return.
///
/// Like a real interrupt handler, `body` is responsible for calling
/// `System::isr_prologue` and `System::isr_epilogue` around its kernel
/// operations (`System::tick_handler` does this internally).
pub fn raise_isr<Traits: PortInstance, R>(body: impl FnOnce() -> R) -> R {
    let state = Traits::port_state();
    state.sched.lock().isr_depth += 1;
    let result = body();
    state.sched.lock().isr_depth -= 1;
    state.dispatch_pending::<Traits>();
    result
}

/// Get a flag indicating whether the tick interrupt is currently unmasked.
pub fn is_tick_enabled<Traits: PortInstance>() -> bool {
    Traits::port_state().sched.lock().tick_enabled
}

/// The number of context switches committed since boot.
pub fn context_switch_count<Traits: PortInstance>() -> u64 {
    Traits::port_state().sched.lock().switch_count
}

/// Allocate a stack region accepted by `System::thread_init`. The region is
/// leaked; the simulation never actually executes on it.
pub fn alloc_stack(len: usize) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(len.max(1), STACK_ALIGN).unwrap();
    // Safety: `layout` has a non-zero size
    unsafe { std::alloc::alloc_zeroed(layout) }
}

/// The stack alignment required by this port.
pub const STACK_ALIGN: usize = 16;

/// The smallest stack size accepted by this port.
pub const STACK_MIN_SIZE: usize = 128;

/// Define a system trait type implementing the port traits against a
/// fresh instance of the port state.
///
/// The resulting type still needs `axon_kernel::configure_kernel!` to become
/// a complete kernel instantiation.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::axon_kernel::{PortThreading, PortTimer, ThreadCb};
            use $crate::{PortInstance, State, ThreadState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadState;
                type IntMask = bool;

                const STACK_MIN_SIZE: usize = $crate::STACK_MIN_SIZE;
                const STACK_ALIGN: usize = $crate::STACK_ALIGN;

                unsafe fn raise_int_mask() -> bool {
                    PORT_STATE.raise_int_mask()
                }

                unsafe fn restore_int_mask(prev: bool) {
                    PORT_STATE.restore_int_mask::<Self>(prev)
                }

                fn is_int_mask_raised() -> bool {
                    PORT_STATE.is_int_mask_raised()
                }

                unsafe fn request_context_switch() {
                    PORT_STATE.request_context_switch()
                }

                unsafe fn start_first_thread(_thread: &'static ThreadCb<Self>) -> ! {
                    unreachable!(
                        "the simulation port starts scheduling via `axon_port_std::boot`"
                    )
                }

                unsafe fn initialize_thread_state(
                    thread: &'static ThreadCb<Self>,
                    entry: fn(usize),
                    param: usize,
                    stack_base: *mut u8,
                    stack_size: usize,
                ) {
                    PORT_STATE.initialize_thread_state::<Self>(
                        thread, entry, param, stack_base, stack_size,
                    )
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                fn is_last_interrupt() -> bool {
                    PORT_STATE.is_last_interrupt()
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                unsafe fn tick_init() {
                    PORT_STATE.tick_init()
                }

                unsafe fn tick_enable() {
                    PORT_STATE.tick_enable()
                }

                unsafe fn tick_disable() {
                    PORT_STATE.tick_disable()
                }
            }
        }
    };
}
