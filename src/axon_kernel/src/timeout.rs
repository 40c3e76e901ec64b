//! The delta-encoded timer wheel.
//!
//! Pending timeouts form a circular doubly linked list anchored at a
//! sentinel node whose delta is [`TICK_MAX`]. Each non-sentinel node stores
//! the tick distance from its predecessor's firing time to its own, so a
//! tick only ever touches the first node's counter, no matter how many
//! timeouts are pending. The sum of all deltas equals the distance to the
//! last timeout's firing instant.
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    tick,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading, TICK_MAX, UTicks,
};

/// Timeout callback function.
///
/// Called in interrupt context with the interrupt-masking lock held; the
/// guard is threaded through so the callback may release it temporarily
/// (the timer layer does, around user callbacks).
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A node of the timer wheel.
///
/// Embedded in [`TimerCb`](crate::TimerCb) for application timers and in
/// [`ThreadCb`](crate::ThreadCb) for wait timeouts, so a registered node can
/// never outlive its containing control block's registration.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// Ticks between the predecessor's firing time and this node's.
    /// `TICK_MAX` for the sentinel.
    delta: CpuLockCell<Traits, UTicks>,

    /// Forms the wheel's circular list. `None` ⇒ not registered.
    link: CpuLockCell<Traits, Option<StaticLink<Timeout<Traits>>>>,

    callback: CpuLockCell<Traits, TimeoutFn<Traits>>,
    param: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> Init for Timeout<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(0);
}

/// The initial callback of a fresh [`Timeout`].
fn unreachable_timeout_handler<Traits: PortThreading>(
    _: usize,
    lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    debug_assert!(false, "timeout fired without a callback assigned");
    lock
}

impl<Traits: PortThreading> Timeout<Traits> {
    const fn new(delta: UTicks) -> Self {
        Self {
            delta: CpuLockCell::new(delta),
            link: CpuLockCell::new(None),
            callback: CpuLockCell::new(unreachable_timeout_handler::<Traits>),
            param: CpuLockCell::new(0),
        }
    }

    /// Assign the callback invoked when the node fires.
    pub(crate) fn prepare(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        callback: TimeoutFn<Traits>,
        param: usize,
    ) {
        debug_assert!(self.link.get(&*lock).is_none());
        self.callback.replace(&mut *lock, callback);
        self.param.replace(&mut *lock, param);
    }

    /// Get a flag indicating whether the node is registered in the wheel.
    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.get(&*lock).is_some()
    }
}

impl<Traits: PortThreading> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("self", &(self as *const _))
            .field("delta", &self.delta)
            .finish_non_exhaustive()
    }
}

/// The kernel-global state of the timer wheel.
pub(crate) struct TimeoutGlobals<Traits: PortThreading> {
    /// The immovable anchor of the wheel. Linked as the permanent first
    /// element by [`init_wheel`]; its `TICK_MAX` delta means every insertion
    /// walk stops before wrapping past it.
    sentinel: Timeout<Traits>,

    /// The circular list of pending timeouts, headed by `sentinel`.
    wheel: CpuLockCell<Traits, StaticListHead<Timeout<Traits>>>,
}

impl<Traits: PortThreading> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sentinel: Timeout::new(TICK_MAX),
        wheel: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("wheel", &self.wheel)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access the wheel.
macro_rules! wheel_accessor {
    ($globals:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new(
            &$globals.wheel,
            &Static,
            |timeout: &Timeout<Traits>| &timeout.link,
            $key,
        );

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

/// Link the sentinel into the empty wheel. Called once by `System::init`.
pub(crate) fn init_wheel<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let globals = &Traits::state().timeouts;
    debug_assert!(globals.wheel.get(&*lock).is_empty());

    let mut accessor = wheel_accessor!(globals, lock.borrow_mut());
    // Safety: A fresh sentinel is unlinked
    unsafe {
        accessor
            .push_back(Ident(&globals.sentinel))
            .unwrap_unchecked()
    };
}

/// Register `timeout` to fire after `ticks` ticks.
///
/// The walk consumes each predecessor's delta from `ticks` until the
/// insertion point is found. The comparison is `<=`, not `<`: a node with
/// the same deadline as an existing one is placed *after* it (with a zero
/// delta), so equal deadlines fire in insertion order.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &'static Timeout<Traits>,
    ticks: UTicks,
) {
    debug_assert!(ticks > 0);
    debug_assert!(!timeout.is_linked(lock.borrow_mut()));

    let globals = &Traits::state().timeouts;
    let sentinel = Ident(&globals.sentinel);

    let (at, delta) = {
        let accessor = wheel_accessor!(globals, lock.borrow_mut());
        let mut remaining = ticks;

        // Safety: The sentinel is always linked
        let mut at = unsafe { accessor.next(sentinel).unwrap_unchecked() };
        while let Some(cur) = at {
            let cur_delta = cur.0.delta.get(&**accessor.cell_key());
            if cur_delta <= remaining {
                remaining -= cur_delta;
                // Safety: `cur` was just read from the list
                at = unsafe { accessor.next(cur).unwrap_unchecked() };
            } else {
                break;
            }
        }
        (at, remaining)
    };

    timeout.delta.replace(&mut *lock, delta);
    {
        let mut accessor = wheel_accessor!(globals, lock.borrow_mut());
        // Safety: `timeout` is unlinked (checked above). `at` is never the
        //         sentinel - the walk reports the wrap-around as `None` -
        //         so the head pointer stays on the sentinel.
        unsafe { accessor.insert(Ident(timeout), at).unwrap_unchecked() };
    }

    if let Some(successor) = at {
        // Preserve the successor's absolute deadline
        let successor_delta = successor.0.delta.get(&*lock);
        debug_assert!(successor_delta > delta);
        successor
            .0
            .delta
            .replace(&mut *lock, successor_delta - delta);
    }

    tick::source_acquire::<Traits>(lock);
}

/// Unregister `timeout`, returning its delta to the successor so later
/// deadlines are unaffected. Does nothing if it's not registered.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &'static Timeout<Traits>,
) {
    if timeout.link.get(&*lock).is_none() {
        return;
    }

    let globals = &Traits::state().timeouts;

    // `next` reports the wrap-around to the sentinel as `None`, which is
    // exactly the case where no successor needs adjusting
    let successor = {
        let accessor = wheel_accessor!(globals, lock.borrow_mut());
        // Safety: `timeout` is linked (checked above)
        unsafe { accessor.next(Ident(timeout)).unwrap_unchecked() }
    };
    if let Some(successor) = successor {
        let sum = successor
            .0
            .delta
            .get(&*lock)
            .saturating_add(timeout.delta.get(&*lock));
        successor.0.delta.replace(&mut *lock, sum);
    }

    {
        let mut accessor = wheel_accessor!(globals, lock.borrow_mut());
        // Safety: `timeout` is linked (checked above)
        unsafe { accessor.remove(Ident(timeout)).unwrap_unchecked() };
    }

    tick::source_release::<Traits>(lock);
}

/// Advance the wheel by one tick and fire the due timeouts,
/// earliest-deadline-first, FIFO among ties.
///
/// Runs in the tick handler with the interrupt-masking lock held; the lock
/// guard is threaded through the callbacks.
pub(crate) fn handle_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let globals = &Traits::state().timeouts;
    let sentinel = Ident(&globals.sentinel);

    // Nothing to do before `init` links the sentinel
    if globals.wheel.get(&*lock).is_empty() {
        return lock;
    }

    let first = {
        let accessor = wheel_accessor!(globals, lock.borrow_mut());
        // Safety: The sentinel is always linked
        unsafe { accessor.next(sentinel).unwrap_unchecked() }
    };
    let Some(first) = first else {
        return lock;
    };

    let first_delta = first.0.delta.get(&*lock);
    debug_assert!(first_delta > 0);
    first.0.delta.replace(&mut *lock, first_delta - 1);

    // Every node that reached a zero delta is due on this very tick. Unlink
    // each one before invoking its callback; a periodic timer's callback
    // re-arms it first thing, so the callback itself can still cancel the
    // re-armed instance.
    loop {
        let head = {
            let accessor = wheel_accessor!(globals, lock.borrow_mut());
            // Safety: The sentinel is always linked
            unsafe { accessor.next(sentinel).unwrap_unchecked() }
        };
        let Some(head) = head else { break };
        if head.0.delta.get(&*lock) != 0 {
            break;
        }

        {
            let mut accessor = wheel_accessor!(globals, lock.borrow_mut());
            // Safety: `head` was just read from the list
            unsafe { accessor.remove(head).unwrap_unchecked() };
        }
        tick::source_release::<Traits>(lock.borrow_mut());

        let callback = head.0.callback.get(&*lock);
        let param = head.0.param.get(&*lock);
        lock = callback(param, lock);
    }

    lock
}

/// Ticks until `timeout` fires: the sum of deltas along the predecessor
/// chain back to the sentinel. O(n) in the number of earlier timeouts.
/// Returns 0 for an unregistered node.
pub(crate) fn remaining_ticks<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &'static Timeout<Traits>,
) -> UTicks {
    if timeout.link.get(&*lock).is_none() {
        return 0;
    }

    let globals = &Traits::state().timeouts;
    let sentinel = Ident(&globals.sentinel);
    let accessor = wheel_accessor!(globals, lock);

    let mut sum: UTicks = 0;
    let mut cur = Ident(timeout);
    while cur != sentinel {
        sum = sum.saturating_add(cur.0.delta.get(&**accessor.cell_key()));
        // Safety: `cur` is linked; the walk started from a linked node
        match unsafe { accessor.prev(cur).unwrap_unchecked() } {
            Some(prev) => cur = prev,
            // `cur` was the first element; only the sentinel can be first
            None => break,
        }
    }
    sum
}
