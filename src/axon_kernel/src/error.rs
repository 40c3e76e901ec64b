//! Error codes returned by the kernel API.
//!
//! Each operation has its own error enum listing exactly the conditions it
//! can report. Recoverable conditions (a timed-out wait, an empty semaphore
//! poll) are ordinary status values; internal invariant violations are debug
//! assertions, never error codes.

/// Define a public per-operation error enum.
macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        pub enum $Name:ident {
            $(
                $( #[doc $( $vdoc:tt )*] )*
                $Variant:ident,
            )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $(
                $( #[doc $( $vdoc )*] )*
                $Variant,
            )*
        }
    };
}

/// Define a single-variant error type used internally to construct the
/// public per-operation errors, along with its `From` conversions.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant ),*
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_error! {
    /// Error type for `System::init`.
    pub enum InitKernelError {
        /// The kernel has already been initialized, or the interrupt mask is
        /// raised.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::lock_enter` and `System::lock_exit`.
    pub enum SchedulerLockError {
        /// The scheduler is not active, or `lock_exit` was called without a
        /// matching `lock_enter`.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::thread_init`.
    pub enum InitThreadError {
        /// The kernel is uninitialized or the interrupt mask is raised.
        BadContext,
        /// The priority is out of range, or the stack pointer is null.
        BadParam,
        /// The control block is already initialized.
        BadObjectState,
        /// The stack is smaller than the port's minimum.
        StackTooSmall,
    }
}

define_error! {
    /// Error type for `System::thread_terminate`.
    pub enum TerminateThreadError {
        /// The interrupt mask is raised.
        BadContext,
        /// The control block is invalid or the thread is already terminated.
        BadObjectState,
    }
}

define_error! {
    /// Error type for `System::thread_set_priority`.
    pub enum SetThreadPriorityError {
        /// The interrupt mask is raised.
        BadContext,
        /// The priority is out of range.
        BadParam,
        /// The control block is invalid or the thread is terminated.
        BadObjectState,
    }
}

define_error! {
    /// Error type for `System::thread_yield`.
    pub enum YieldThreadError {
        /// The caller is not a running thread.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::thread_current`.
    pub enum GetCurrentThreadError {
        /// The scheduler has not started, or the interrupt mask is raised.
        BadContext,
    }
}

define_error! {
    /// Error type for thread state queries.
    pub enum QueryThreadError {
        /// The interrupt mask is raised.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::timer_init`.
    pub enum InitTimerError {
        /// The interrupt mask is raised.
        BadContext,
        /// The timer is currently armed.
        BadObjectState,
    }
}

define_error! {
    /// Error type for `System::timer_start`.
    pub enum StartTimerError {
        /// The interrupt mask is raised.
        BadContext,
        /// `ticks` is zero.
        BadParam,
        /// The timer is uninitialized or already armed.
        BadObjectState,
    }
}

define_error! {
    /// Error type for `System::timer_cancel`.
    pub enum CancelTimerError {
        /// The interrupt mask is raised.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::timer_is_running` and
    /// `System::timer_remaining`.
    pub enum QueryTimerError {
        /// The interrupt mask is raised.
        BadContext,
    }
}

define_error! {
    /// Error type for `System::sem_init`.
    pub enum InitSemaphoreError {
        /// The interrupt mask is raised.
        BadContext,
        /// The semaphore still has waiting threads.
        BadObjectState,
    }
}

define_error! {
    /// Error type for `System::sem_wait`.
    pub enum WaitSemaphoreError {
        /// The caller is not in a waitable context (running thread, scheduler
        /// unlocked).
        BadContext,
    }
}

define_error! {
    /// Error type for `System::sem_wait_timeout`.
    pub enum WaitSemaphoreTimeoutError {
        /// The caller is not in a waitable context (running thread, scheduler
        /// unlocked).
        BadContext,
        /// `ticks` is zero.
        BadParam,
        /// The wait timed out before the semaphore was posted.
        Timeout,
    }
}

define_error! {
    /// Error type for `System::sem_poll`.
    pub enum PollSemaphoreError {
        /// The interrupt mask is raised.
        BadContext,
        /// The semaphore's count is zero.
        Timeout,
    }
}

define_error! {
    /// Error type for `System::sem_post`.
    pub enum SignalSemaphoreError {
        /// The kernel is uninitialized or the interrupt mask is raised.
        BadContext,
    }
}

define_suberror! {
    /// `BadContext`
    #[into(InitKernelError)]
    #[into(SchedulerLockError)]
    #[into(InitThreadError)]
    #[into(TerminateThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(YieldThreadError)]
    #[into(GetCurrentThreadError)]
    #[into(QueryThreadError)]
    #[into(InitTimerError)]
    #[into(StartTimerError)]
    #[into(CancelTimerError)]
    #[into(QueryTimerError)]
    #[into(InitSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(PollSemaphoreError)]
    #[into(SignalSemaphoreError)]
    pub(super) enum BadContextError {
        BadContext,
    }
}
