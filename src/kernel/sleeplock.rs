// Long-term locks for processes. A sleeplock parks its waiter
// instead of spinning, so it may be held across disk I/O, and
// must never be taken from an interrupt handler or inside a
// spinlock critical section.

use crate::proc::{self, CPUS, PTABLE};
use crate::spinlock::Mutex;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub struct SleepLock<T> {
    lk: Mutex<SleepLockInfo>, // spinlock protecting this sleep lock
    data: UnsafeCell<T>,
    name: &'static str,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

struct SleepLockInfo {
    locked: bool,
    pid: usize, // holder, for debugging
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lk: Mutex::new(SleepLockInfo { locked: false, pid: 0 }, "sleep lock"),
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut lk = self.lk.lock();
        while lk.locked {
            lk = proc::sleep(self.chan(), lk);
        }
        lk.locked = true;
        lk.pid = CPUS.my_proc().map_or(0, |p| p.pid());
        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        let lk = self.lk.lock();
        lk.locked && lk.pid == CPUS.my_proc().map_or(0, |p| p.pid())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn unlock(guard: SleepLockGuard<'_, T>) -> &'_ SleepLock<T> {
        guard.sleep_lock()
    }

    fn chan(&self) -> usize {
        self as *const _ as usize
    }
}

impl<T> core::fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SleepLock({})", self.name)
    }
}

impl<'a, T> SleepLockGuard<'a, T> {
    pub fn sleep_lock(&self) -> &'a SleepLock<T> {
        self.lock
    }
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.lock.holding(), "release {}", self.lock.name);
        let mut lk = self.lock.lk.lock();
        lk.locked = false;
        lk.pid = 0;
        drop(lk);
        PTABLE.wakeup(self.lock.chan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn parks_until_the_holder_releases() {
        let l = Arc::new(SleepLock::new(0u32, "test"));
        let l2 = Arc::clone(&l);

        let g = l.lock();
        let waiter = thread::spawn(move || {
            let mut g = l2.lock();
            *g += 1;
            *g
        });
        // give the waiter a moment to reach the lock
        thread::sleep(std::time::Duration::from_millis(20));
        drop(g);
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn exclusion_under_contention() {
        let l = Arc::new(SleepLock::new(0u64, "count"));
        let mut handles = vec![];
        for _ in 0..4 {
            let l = Arc::clone(&l);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*l.lock(), 4000);
    }
}
