// One-shot initialization cells for late-initialized globals
// (superblock, console sink, kernel page directory). These spin
// rather than sleep: they are only contended during bring-up.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

const UNINIT: usize = 0;
const BLOCKED: usize = 1;
const READY: usize = 2;

pub struct OnceLock<T> {
    state: AtomicUsize,
    inner: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNINIT),
            inner: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            Some(unsafe { self.get_unchecked() })
        } else {
            None
        }
    }

    pub fn set(&self, value: T) -> Result<(), T> {
        match self
            .state
            .compare_exchange(UNINIT, BLOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                unsafe { (*self.inner.get()).as_mut_ptr().write(value) };
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn get_or_init(&self, func: impl FnOnce() -> T) -> &T {
        let mut func = Some(func);
        loop {
            match self.state.load(Ordering::Acquire) {
                READY => break unsafe { self.get_unchecked() },
                BLOCKED => crate::x86::pause(),
                _ => {
                    if let Some(f) = func.take() {
                        // on a lost race fall through and wait for READY
                        let _ = self.set(f());
                    }
                }
            }
        }
    }

    unsafe fn get_unchecked(&self) -> &T {
        (*self.inner.get()).assume_init_ref()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe { (*self.inner.get()).assume_init_drop() }
        }
    }
}
