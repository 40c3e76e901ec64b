//! Helpers shared by the kernel test binaries.
#![allow(dead_code)]
use axon_kernel::{System, ThreadCb};
use axon_port_std::PortInstance;

/// Entry point for threads that exist only as scheduling subjects. The
/// simulation port never actually executes thread bodies.
pub fn noop_entry(_: usize) {}

/// Create a thread with a freshly allocated stack.
pub fn spawn<Traits: PortInstance>(thread: &'static ThreadCb<Traits>, priority: usize) {
    System::<Traits>::thread_init(
        thread,
        noop_entry,
        0,
        axon_port_std::alloc_stack(512),
        512,
        priority,
    )
    .unwrap();
}

/// Whether `thread` currently holds the (simulated) processor.
pub fn current_is<Traits: PortInstance>(thread: &'static ThreadCb<Traits>) -> bool {
    core::ptr::eq(System::<Traits>::thread_current().unwrap(), thread)
}

/// Whether the built-in idle thread currently holds the processor.
pub fn idle_is_current<Traits: PortInstance>() -> bool {
    let current = System::<Traits>::thread_current().unwrap();
    System::<Traits>::thread_priority(current).unwrap() == axon_kernel::IDLE_PRIORITY
}

/// Define a module holding one isolated kernel instantiation for a single
/// test. Extra `configure_kernel!` options can be appended after `quantum`.
macro_rules! kernel_test_env {
    (mod $name:ident { levels: $levels:expr, quantum: $quantum:expr $(, $($rest:tt)+)? }) => {
        mod $name {
            axon_port_std::use_port!(unsafe pub(super) struct Sys);
            axon_kernel::configure_kernel! {
                unsafe impl KernelCfg for Sys {
                    priority_levels: $levels,
                    round_robin_quantum: $quantum,
                    idle_stack_size: 4096
                    $(, $($rest)+)?
                }
            }

            #[allow(dead_code)]
            pub(super) type System = axon_kernel::System<Sys>;
        }
    };
}
