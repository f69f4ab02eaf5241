//! CPU Lock: the kernel's only mutual exclusion
//!
//! The guest runs on a single virtual CPU, so holding CPU Lock is enough to
//! own every piece of kernel state. Entering it yields a [`CpuLockGuard`],
//! and the guard is the only way to reach the contents of a [`CpuLockCell`].
use core::fmt;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, PortThreading};

pub(super) struct CpuLockTag<Traits>(Traits);

type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;
type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Kernel state that may only be touched while CPU Lock is held.
pub(super) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    #[inline]
    pub(super) fn get<'a>(&'a self, lock: &'a CpuLockGuard<Traits>) -> &'a T {
        self.0.read(&lock.token)
    }

    #[inline]
    pub(super) fn get_mut<'a>(&'a self, lock: &'a mut CpuLockGuard<Traits>) -> &'a mut T {
        self.0.write(&mut lock.token)
    }
}

/// Shows the contents if CPU Lock can be taken, and `<locked>` otherwise.
impl<Traits: PortThreading, T: ?Sized + fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => fmt::Debug::fmt(self.get(&lock), f),
            Err(_) => f.write_str("<locked>"),
        }
    }
}

/// Enter CPU Lock. Fails with `BadContext` if it's already held.
pub(super) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: Only the kernel enters CPU Lock through this path
    if !unsafe { Traits::try_enter_cpu_lock() } {
        return Err(BadContextError::BadContext);
    }
    Ok(CpuLockGuard {
        // Safety: CPU Lock was free until now, so no other token exists
        token: unsafe { CpuLockToken::new_unchecked() },
    })
}

/// Holds CPU Lock until dropped.
pub(super) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: This guard entered CPU Lock, and leaving it is ours to do
        unsafe { Traits::leave_cpu_lock() };
    }
}
