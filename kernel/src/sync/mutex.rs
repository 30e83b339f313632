//! Kernel spinlock.
//!
//! Ticket-based for fairness: each waiter draws an ascending ticket number
//! and the lock serves tickets in order, so contention cannot starve any
//! one thread.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// A lock that provides mutually exclusive data access.
pub struct Mutex<T: ?Sized> {
    /// Next ticket to hand out.
    next: AtomicUsize,
    /// Ticket currently allowed in.
    serving: AtomicUsize,
    data: UnsafeCell<T>,
}

/// Grants access to the locked data; dropping it releases the lock.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
}

// The mutex hands the protected value to one thread at a time, which is
// sound exactly when moving the value between threads is.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, spinning until this thread's ticket comes up.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        MutexGuard { lock: self }
    }

    /// Acquires the lock only if no one holds it and no one is queued for
    /// it: takes the next ticket iff that ticket would be served at once.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Acquire);
        self.next
            .compare_exchange(serving, serving + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }

    /// Access through an exclusive reference needs no locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_tuple("Mutex").field(&&*guard).finish(),
            None => f.write_str("Mutex(<locked>)"),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Holding the guard means holding the lock, so the data is ours.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Pass the lock to the next ticket in line.
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_access() {
        let lock = Mutex::new(0);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_respects_holder() {
        let lock = Mutex::new('a');
        let held = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(held);

        let guard = lock.try_lock().unwrap();
        assert_eq!(*guard, 'a');
        drop(guard);
        assert!(!lock.is_locked());
    }
}
