//! A simulated hypervisor
//!
//! Owns the shared info page and lets host threads outside the guest signal
//! event channels. The guest domain blocks on [`Hypervisor::block_until`]
//! when its idle thread has nothing to do.
use pvrt_kernel::{shared::SharedInfo, EventPort};
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// The longest time the domain sleeps before checking the abort condition
/// again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Hypervisor {
    shared: SharedInfo,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Hypervisor {
    pub const fn new() -> Self {
        Self {
            shared: SharedInfo::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn shared_info(&self) -> &SharedInfo {
        &self.shared
    }

    /// Signal `port` on `vcpu` and wake up the domain if it's blocked.
    /// Returns `true` if this raised a new upcall.
    pub fn send(&self, port: EventPort, vcpu: usize) -> bool {
        let raised = {
            let _guard = self.lock();
            self.shared.raise_event(port as usize, vcpu)
        };
        log::trace!("send({port}) raised = {raised}");
        self.cond.notify_all();
        raised
    }

    /// Wake up the domain without signaling anything.
    pub fn notify(&self) {
        let _guard = self.lock();
        self.cond.notify_all();
    }

    /// Block the calling host thread until an upcall is pending on `vcpu`,
    /// `deadline` is reached, or `abort` returns `true`.
    pub fn block_until(&self, vcpu: usize, deadline: Instant, abort: impl Fn() -> bool) {
        let vcpu = self.shared.vcpu(vcpu);
        let mut guard = self.lock();
        loop {
            if vcpu.upcall_pending() || abort() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let timeout = (deadline - now).min(POLL_INTERVAL);
            guard = match self.cond.wait_timeout(guard, timeout) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self::new()
    }
}
