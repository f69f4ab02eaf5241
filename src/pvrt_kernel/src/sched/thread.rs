//! Thread control blocks
use core::fmt;

use crate::{PortThreading, Time};

bitflags::bitflags! {
    /// Status flags of a thread.
    pub struct ThreadFlags: u8 {
        /// The thread is eligible for dispatch.
        const RUNNABLE = 1 << 0;
        /// The thread has exited and is waiting to be reclaimed.
        const EXITED = 1 << 1;
    }
}

/// A handle to a thread.
///
/// The handle stays valid until the thread's storage is reclaimed. After that,
/// every operation taking it fails with `NoAccess`, even if a new thread
/// reuses the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub(super) index: usize,
    pub(super) serial: u64,
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId({}#{})", self.index, self.serial)
    }
}

/// The entry point of a thread.
#[derive(Clone, Copy)]
pub struct ThreadEntry {
    pub function: fn(usize),
    pub arg: usize,
}

impl fmt::Debug for ThreadEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadEntry")
            .field("function", &(self.function as *const ()))
            .field("arg", &self.arg)
            .finish()
    }
}

/// *Thread control block*.
pub(crate) struct ThreadCb<Traits: PortThreading> {
    pub(crate) name: &'static str,
    pub(crate) context: Traits::Context,
    /// `EXITED` also tells which queue the thread is in: the exited queue if
    /// set, the run queue otherwise.
    pub(crate) flags: ThreadFlags,
    /// The absolute deadline at which a sleeping thread becomes eligible.
    /// `0` means no deadline.
    pub(crate) wakeup_time: Time,
    pub(crate) serial: u64,
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    #[inline]
    pub(crate) fn is_runnable(&self) -> bool {
        self.flags.contains(ThreadFlags::RUNNABLE)
    }

    #[inline]
    pub(crate) fn is_exited(&self) -> bool {
        self.flags.contains(ThreadFlags::EXITED)
    }

    /// Decide whether the thread can be dispatched at `now`. A sleeping
    /// thread whose deadline has elapsed is made runnable.
    pub(crate) fn try_promote(&mut self, now: Time) -> bool {
        if self.is_runnable() {
            return true;
        }
        if self.wakeup_time != 0 && self.wakeup_time <= now {
            self.wakeup_time = 0;
            self.flags.insert(ThreadFlags::RUNNABLE);
            return true;
        }
        false
    }

    pub(crate) fn block(&mut self) {
        self.flags.remove(ThreadFlags::RUNNABLE);
        self.wakeup_time = 0;
    }

    pub(crate) fn wake(&mut self) {
        self.wakeup_time = 0;
        self.flags.insert(ThreadFlags::RUNNABLE);
    }
}

impl<Traits: PortThreading> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("flags", &self.flags)
            .field("wakeup_time", &self.wakeup_time)
            .finish()
    }
}
