//! Static kernel configuration.
//!
//! [`configure_kernel!`](crate::configure_kernel) turns a port-implementing
//! trait type into a complete kernel instantiation: it implements
//! [`KernelCfg`](crate::KernelCfg), generating the kernel-state singleton,
//! the ready array sized for the configured number of priority levels, and
//! the idle thread's stack.

/// Implement [`KernelCfg`](crate::KernelCfg) for a type that already
/// implements the port traits.
///
/// ```rust,ignore
/// axon_kernel::configure_kernel! {
///     unsafe impl KernelCfg for SystemTraits {
///         priority_levels: 16,        // 3..=256, level 0 reserved for idle
///         round_robin_quantum: 2,     // ticks; 0 disables round-robin
///         idle_stack_size: 4096,
///         adaptive_tick: true,        // optional, default false
///         tick_hook: my_tick_hook,    // optional hooks, default none
///     }
/// }
/// ```
///
/// The `unsafe` keyword acknowledges that the configuration defines the
/// memory the kernel will hand to the port (the idle stack) and must match
/// the port's alignment requirements.
#[macro_export]
macro_rules! configure_kernel {
    (
        unsafe impl KernelCfg for $Traits:ty {
            priority_levels: $levels:expr,
            round_robin_quantum: $quantum:expr,
            idle_stack_size: $idle_stack:expr
            $(, adaptive_tick: $adaptive:expr )?
            $(, context_switch_hook: $context_switch_hook:expr )?
            $(, tick_hook: $tick_hook:expr )?
            $(, idle_hook: $idle_hook:expr )?
            $(,)?
        }
    ) => {
        impl $crate::KernelCfg for $Traits {
            const PRIORITY_LEVELS: usize = {
                assert!(
                    $levels >= 3 && $levels <= 256,
                    "`priority_levels` must be in `3..=256`"
                );
                $levels
            };

            const ROUND_ROBIN_QUANTUM: $crate::UTicks = $quantum;

            const ADAPTIVE_TICK: bool = false $(|| $adaptive)?;

            const CONTEXT_SWITCH_HOOK: Option<$crate::ContextSwitchHookFn<Self>> =
                $crate::__opt_hook!($($context_switch_hook)?);

            const TICK_HOOK: Option<fn()> = $crate::__opt_hook!($($tick_hook)?);

            const IDLE_HOOK: Option<fn()> = $crate::__opt_hook!($($idle_hook)?);

            type ReadyArray = $crate::readyqueue::PrioArray<
                Self,
                { $crate::utils::num_bitmap_groups($levels) },
                { $levels },
            >;

            fn state() -> &'static $crate::KernelState<Self> {
                static STATE: $crate::KernelState<$Traits> =
                    <$crate::KernelState<$Traits> as $crate::utils::Init>::INIT;
                &STATE
            }

            fn idle_stack() -> (*mut u8, usize) {
                static STACK: $crate::utils::RawCell<
                    $crate::utils::AlignedStorage<{ $idle_stack }, 16>,
                > = <$crate::utils::RawCell<
                    $crate::utils::AlignedStorage<{ $idle_stack }, 16>,
                > as $crate::utils::Init>::INIT;
                (STACK.get() as *mut u8, $idle_stack)
            }
        }
    };
}

/// Used by `configure_kernel!` to default an absent hook to `None`.
#[doc(hidden)]
#[macro_export]
macro_rules! __opt_hook {
    () => {
        None
    };
    ($hook:expr) => {
        Some($hook)
    };
}
