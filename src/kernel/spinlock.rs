// Mutual exclusion spin locks.
//
// Acquiring a Mutex disables interrupts on the local cpu for as
// long as the guard lives (the IntrLock it carries is the
// pushcli/popcli nesting). Holding any spin lock therefore makes
// the current cpu non-preemptible, which is what keeps a lock
// holder from deadlocking against its own interrupt handler.

use crate::proc::{IntrLock, CPUS};
use crate::x86;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

const NO_CPU: usize = usize::MAX;

pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    // the holding cpu and the call site of the acquire, for debugging.
    cpu: AtomicUsize,
    acquired_at: AtomicPtr<Location<'static>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
    _intr: IntrLock,
}

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            cpu: AtomicUsize::new(NO_CPU),
            acquired_at: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    // Acquire the lock, spinning until it is free. Fatal if this
    // cpu already holds it; the lock is not recursive.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let intr = CPUS.intr_lock(); // disable interrupts to avoid deadlock
        if self.holding() {
            panic!("acquire {}", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            x86::pause();
        }
        // critical-section loads and stores stay after this point.
        fence(Ordering::SeqCst);

        self.cpu.store(x86::cpu_id(), Ordering::Relaxed);
        self.acquired_at
            .store(Location::caller() as *const _ as *mut _, Ordering::Relaxed);
        MutexGuard { mutex: self, _intr: intr }
    }

    // Is this cpu holding the lock? Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == x86::cpu_id()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // Release a lock held by a guard that cannot be dropped in
    // place: the scheduler hands a locked process table to the
    // first swtch into a new process, and the new side releases
    // it here.
    //
    // # Safety
    // The caller must be on the cpu that logically owns the guard.
    pub unsafe fn force_unlock(&self) {
        assert!(self.holding(), "force_unlock {}", self.name);
        self.release();
        CPUS.intr_unlock();
    }

    // Access the data without locking. Only for the panic path and
    // procdump, where wedging on a held lock would be worse.
    //
    // # Safety
    // Races with any holder.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }

    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        guard.mutex()
    }

    fn release(&self) {
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.acquired_at.store(ptr::null_mut(), Ordering::Relaxed);
        // critical-section accesses stay before the store below.
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub fn holding(&self) -> bool {
        self.mutex.holding()
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.mutex.holding(), "release {}", self.mutex.name);
        self.mutex.release();
        // _intr drops afterwards and pops the interrupt nesting.
    }
}
