//! Counting semaphore.
//!
//! `nix` doesn't expose POSIX `sem_t`, and nothing else in the dependency
//! stack wraps it, so this is a small `Condvar`+`Mutex<usize>` substitute
//! used for `sender_sem` and `halt_pipeline` (spec §4.9, §5).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// `sem_post`.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// `sem_wait`: blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// `sem_trywait`.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Bounded wait, used by the shutdown watchdog path.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let (guard, result) = self.cond.wait_timeout(count, timeout).unwrap();
            count = guard;
            if result.timed_out() {
                return *count > 0 && {
                    *count -= 1;
                    true
                };
            }
        }
    }

    pub fn current(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
        assert_eq!(sem.current(), 0);
    }

    #[test]
    fn try_wait_on_empty_returns_false() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_unparks_after_post_from_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait();
        });
        thread::sleep(Duration::from_millis(20));
        sem.post();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_when_never_posted() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn initial_count_two_allows_two_waits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }
}
