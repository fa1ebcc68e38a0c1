//! Process-shared lock and condition signal that live inside a mapped region.
//!
//! Both types are `#[repr(C)]` wrappers around the pthread state and contain
//! nothing but that state, so a region mapped at different addresses in
//! different processes still refers to the same primitive. They are never
//! created by value: the creating process calls `init` on memory it just
//! mapped, every other process calls `from_existing` on the same bytes.
//!
//! A process that dies while holding the lock leaves it held for good; the
//! room has to be recreated in that case.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;

#[inline]
fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Constructs the mutex in place with `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    /// `this` must point to writable memory large enough for `SharedMutex`,
    /// and no other thread or process may touch it until this returns.
    pub unsafe fn init(this: *mut SharedMutex) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let result = check(libc::pthread_mutexattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|_| check(libc::pthread_mutex_init((*this).raw.get(), attr.as_ptr())));
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    /// # Safety
    /// `this` must point to a mutex already constructed with `init` by some
    /// process, and stay mapped for `'a`.
    pub unsafe fn from_existing<'a>(this: *const SharedMutex) -> &'a SharedMutex {
        &*this
    }

    pub fn lock(&self) -> io::Result<SharedMutexGuard<'_>> {
        check(unsafe { libc::pthread_mutex_lock(self.raw.get()) })?;
        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

/// Unlocks on drop. Not `Send`: pthread requires the owner thread to unlock.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Constructs the condition variable in place with `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    /// Same contract as `SharedMutex::init`.
    pub unsafe fn init(this: *mut SharedCondvar) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let result = check(libc::pthread_condattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|_| check(libc::pthread_cond_init((*this).raw.get(), attr.as_ptr())));
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        result
    }

    /// # Safety
    /// Same contract as `SharedMutex::from_existing`.
    pub unsafe fn from_existing<'a>(this: *const SharedCondvar) -> &'a SharedCondvar {
        &*this
    }

    /// Releases the guard's mutex, blocks, and re-acquires it on wake.
    ///
    /// Wakeups may be spurious; callers re-check their predicate in a loop.
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) })
    }

    pub fn notify_all(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_broadcast(self.raw.get()) })
    }
}
