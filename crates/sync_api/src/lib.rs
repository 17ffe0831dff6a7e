//! Blocking-primitive interfaces shared by the storage crates.
//!
//! The storage layer needs two primitives from its embedder: a lock around
//! shared state ([`Mutex`]) and a counting semaphore ([`Semaphore`]) for
//! command completion and timed waits. Kernel builds wrap their own
//! implementations; the `std` feature supplies host-side ones so the crates
//! can be tested off target.
#![cfg_attr(any(not(feature = "std"), target_os = "none"), no_std)]

use core::{ops::DerefMut, time::Duration};

/// A lock that grants exclusive access to the data it wraps.
pub trait Mutex {
    /// Data the lock protects.
    type Data;

    /// RAII guard; the lock is held for as long as the guard lives.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Wraps `data` in a new, unlocked lock.
    fn new(data: Self::Data) -> Self;

    /// Blocks until the lock is free, then takes it.
    fn lock(&self) -> Self::Guard<'_>;
}

/// Outcome of a timed semaphore wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemWait {
    /// A permit was taken.
    Signaled,
    /// The timeout elapsed without a permit becoming available.
    TimedOut,
}

/// A counting semaphore.
pub trait Semaphore {
    /// Creates a new semaphore holding `permits` permits.
    fn new(permits: usize) -> Self;

    /// Releases one permit, waking a waiter if there is one.
    fn post(&self);

    /// Blocks until a permit is available, then takes it.
    fn wait(&self);

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    fn wait_timeout(&self, timeout: Duration) -> SemWait;
}

#[cfg(all(feature = "std", not(target_os = "none")))]
impl<T> Mutex for std::sync::Mutex<T> {
    type Data = T;
    type Guard<'a>
        = std::sync::MutexGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock().unwrap()
    }
}

#[cfg(all(feature = "std", not(target_os = "none")))]
mod std_semaphore {
    use std::{
        sync::{Condvar, Mutex},
        time::Instant,
    };

    use super::{SemWait, Semaphore};
    use core::time::Duration;

    /// A [`Semaphore`] built on [`std::sync::Condvar`].
    pub struct StdSemaphore {
        permits: Mutex<usize>,
        cvar: Condvar,
    }

    impl Semaphore for StdSemaphore {
        fn new(permits: usize) -> Self {
            Self {
                permits: Mutex::new(permits),
                cvar: Condvar::new(),
            }
        }

        fn post(&self) {
            let mut permits = self.permits.lock().unwrap();
            *permits += 1;
            self.cvar.notify_one();
        }

        fn wait(&self) {
            let mut permits = self.permits.lock().unwrap();
            while *permits == 0 {
                permits = self.cvar.wait(permits).unwrap();
            }
            *permits -= 1;
        }

        fn wait_timeout(&self, timeout: Duration) -> SemWait {
            let deadline = Instant::now() + timeout;
            let mut permits = self.permits.lock().unwrap();
            loop {
                if *permits > 0 {
                    *permits -= 1;
                    return SemWait::Signaled;
                }
                let now = Instant::now();
                if now >= deadline {
                    return SemWait::TimedOut;
                }
                let (guard, _) = self.cvar.wait_timeout(permits, deadline - now).unwrap();
                permits = guard;
            }
        }
    }
}

#[cfg(all(feature = "std", not(target_os = "none")))]
pub use std_semaphore::StdSemaphore;

#[cfg(test)]
mod tests {
    use super::*;

    use std::{sync::Arc, thread};

    #[test]
    fn test_semaphore_counts_permits() {
        let sem = StdSemaphore::new(2);
        sem.wait();
        sem.wait();
        assert_eq!(
            sem.wait_timeout(Duration::from_millis(10)),
            SemWait::TimedOut
        );
        sem.post();
        assert_eq!(
            sem.wait_timeout(Duration::from_millis(10)),
            SemWait::Signaled
        );
    }

    #[test]
    fn test_semaphore_wakes_waiter() {
        let sem = Arc::new(StdSemaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn test_post_before_wait_is_not_lost() {
        let sem = StdSemaphore::new(0);
        sem.post();
        assert_eq!(
            sem.wait_timeout(Duration::from_millis(10)),
            SemWait::Signaled
        );
    }
}
