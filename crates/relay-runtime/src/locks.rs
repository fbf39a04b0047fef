//! Fork-safe locks.
//!
//! `std::sync::Mutex` duplicated by `fork` keeps whatever state the parent's
//! threads held, and there is no way to reinitialize it in place. Locks
//! that the fork protocol must reset in the child are therefore backed by
//! a raw `pthread_mutex_t`, which the child callback rewrites with a fresh
//! initializer.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

pub struct ForkLock<T> {
    mutex: Box<UnsafeCell<libc::pthread_mutex_t>>,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ForkLock<T> {}
unsafe impl<T: Send> Sync for ForkLock<T> {}

impl<T> ForkLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            mutex: Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> ForkLockGuard<'_, T> {
        unsafe {
            libc::pthread_mutex_lock(self.mutex.get());
        }
        ForkLockGuard { lock: self }
    }

    /// Rewrite the underlying mutex with a fresh initializer.
    ///
    /// # Safety
    /// Only valid in a freshly forked child, where no other thread exists
    /// and therefore no thread can hold or contend the lock.
    pub unsafe fn reinit_after_fork(&self) {
        std::ptr::write(self.mutex.get(), libc::PTHREAD_MUTEX_INITIALIZER);
    }

}

pub struct ForkLockGuard<'a, T> {
    lock: &'a ForkLock<T>,
}

impl<T> Deref for ForkLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for ForkLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for ForkLockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.lock.mutex.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_serializes_increments() {
        let lock = Arc::new(ForkLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn reinit_leaves_value_intact() {
        let lock = ForkLock::new(vec![1, 2, 3]);
        unsafe { lock.reinit_after_fork() };
        assert_eq!(*lock.lock(), vec![1, 2, 3]);
    }
}
