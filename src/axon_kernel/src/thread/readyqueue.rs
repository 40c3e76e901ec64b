//! Thread ready array implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::ThreadCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticListHead},
        Init, PrioBitmap, UnwrapInfallible,
    },
    PortThreading,
};

/// The ready array: tracks every Ready (and the Running) thread, segregated
/// by priority, FIFO within a priority.
///
/// This trait is not intended to be implemented on custom types; it exists
/// so that [`KernelState`](crate::KernelState) can embed an instantiation
/// sized for the configured number of priority levels.
pub trait Queue<Traits: PortThreading>:
    Send + Sync + Init + fmt::Debug + 'static + private::Sealed
{
    /// Get the head of the highest-priority non-empty list - the thread the
    /// dispatcher would run next.
    fn front(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<&'static ThreadCb<Traits>>;

    /// Append the thread to the tail of the list at its current priority.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if the thread is already
    /// linked into a queue.
    unsafe fn push_back(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    );

    /// Unlink the thread.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if the thread is not
    /// linked into this queue.
    unsafe fn remove(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    );

    /// Advance the head of the list at `priority` by one position, returning
    /// the new head - the next thread in FIFO order.
    ///
    /// # Safety
    ///
    /// The list at `priority` must be non-empty.
    unsafe fn rotate(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: usize,
    ) -> Option<&'static ThreadCb<Traits>>;

    /// Get a flag indicating whether another thread shares the given
    /// thread's list.
    fn has_peer(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) -> bool;

    /// Get a flag indicating whether the given thread's list holds exactly
    /// two threads.
    fn is_pair(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) -> bool;
}

/// Implements [the sealed trait pattern], which prevents [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The ready array implementation: one circular list per priority level plus
/// an occupancy bitmap.
pub struct PrioArray<Traits: PortThreading, const GROUPS: usize, const LEVELS: usize> {
    /// The segregated lists, in which each list holds the runnable threads
    /// of the corresponding priority in FIFO order. The head is the rotation
    /// position - the thread to run next at that priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>; LEVELS],

    /// The occupancy bitmap, in which each bit indicates whether the list of
    /// the corresponding priority holds any thread.
    bitmap: CpuLockCell<Traits, PrioBitmap<GROUPS>>,
}

impl<Traits: PortThreading, const GROUPS: usize, const LEVELS: usize> Init
    for PrioArray<Traits, GROUPS, LEVELS>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: PortThreading, const GROUPS: usize, const LEVELS: usize> fmt::Debug
    for PrioArray<Traits, GROUPS, LEVELS>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PrioArray")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access a priority list.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new(
            $head,
            &Static,
            |thread: &ThreadCb<Traits>| &thread.queue_link,
            $key,
        );

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

impl<Traits: PortThreading, const GROUPS: usize, const LEVELS: usize> Queue<Traits>
    for PrioArray<Traits, GROUPS, LEVELS>
{
    #[inline]
    fn front(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<&'static ThreadCb<Traits>> {
        let priority = self.bitmap.read(&*lock).find_last_set()?;
        self.queues[priority].get(&*lock).first.map(|i| i.0)
    }

    #[inline]
    unsafe fn push_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let priority = thread.priority.get(&*lock);

        // Safety: `thread` is unlinked, so it shouldn't return
        //         `InsertError::AlreadyLinked`.
        unsafe {
            list_accessor!(&self.queues[priority], lock.borrow_mut())
                .push_back(Ident(thread))
                .unwrap_unchecked();
        }

        self.bitmap.write(&mut *lock).set(priority);
    }

    #[inline]
    unsafe fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let priority = thread.priority.get(&*lock);

        let now_empty = {
            let mut accessor = list_accessor!(&self.queues[priority], lock.borrow_mut());
            // Safety: `thread` is linked to this list, so `remove` shouldn't
            //         return `ItemError::NotLinked`.
            unsafe { accessor.remove(Ident(thread)).unwrap_unchecked() };
            accessor.is_empty()
        };

        if now_empty {
            self.bitmap.write(&mut *lock).clear(priority);
        }
    }

    #[inline]
    unsafe fn rotate(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        priority: usize,
    ) -> Option<&'static ThreadCb<Traits>> {
        let mut accessor = list_accessor!(&self.queues[priority], lock.borrow_mut());

        let first = accessor.front().unwrap_infallible()?;

        // Advancing the head is equivalent to moving the old head to the
        // tail of the circular list
        // Safety: `first` was just read from the list
        unsafe {
            accessor.remove(first).unwrap_unchecked();
            accessor.push_back(first).unwrap_unchecked();
        }

        accessor.front().unwrap_infallible().map(|i| i.0)
    }

    #[inline]
    fn has_peer(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) -> bool {
        match thread.queue_link.get(&*lock) {
            Some(link) => link.next != Ident(thread),
            None => false,
        }
    }

    #[inline]
    fn is_pair(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) -> bool {
        match thread.queue_link.get(&*lock) {
            Some(link) => link.next == link.prev && link.next != Ident(thread),
            None => false,
        }
    }
}

impl<Traits: PortThreading, const GROUPS: usize, const LEVELS: usize> private::Sealed
    for PrioArray<Traits, GROUPS, LEVELS>
{
}
