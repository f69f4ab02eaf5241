#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use core::{fmt, time::Duration};

#[cfg(test)]
#[macro_use]
mod test_utils;

mod error;
mod event;
mod klock;
mod sched;
pub mod shared;
mod upcall;

pub use self::{error::*, event::*, sched::*, upcall::*};
use self::shared::SharedInfo;

/// A point in time measured by [`PortTimer::now`], in nanoseconds. `0` is
/// reserved to mean "no deadline".
pub type Time = u64;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// creating execution contexts and transferring control between them.
///
/// The `unsafe` methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// A handle to a saved execution context.
    type Context: Copy + Send + Sync + fmt::Debug + 'static;

    /// Create an execution context that calls [`run_thread`] with `entry`
    /// when first switched to.
    ///
    /// Precondition: CPU Lock active
    fn create_context(entry: ThreadEntry) -> Result<Self::Context, CreateThreadError>;

    /// Save the calling context to `prev` and resume `next`. Returns when
    /// `prev` is switched back to.
    ///
    /// Precondition: CPU Lock inactive, `prev` is the calling context
    unsafe fn switch_context(prev: Self::Context, next: Self::Context);

    /// Transfer the control to `next`, discarding the current (boot) context.
    ///
    /// Precondition: CPU Lock inactive, a boot context
    unsafe fn dispatch_first(next: Self::Context) -> !;

    /// Release the resources of a context that will never run again.
    ///
    /// Precondition: `ctx` is not the calling context
    unsafe fn destroy_context(ctx: Self::Context);

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state. A port may
    /// deliver a pending upcall here.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Return a flag indicating whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;
}

/// Implemented by a port. Provides access to the state shared with the
/// hypervisor.
///
/// # Safety
///
/// `shared_info` must return the page the hypervisor actually delivers
/// events through, and `current_vcpu` must be less than
/// [`shared::MAX_VIRT_CPUS`].
pub unsafe trait PortEvents {
    /// Whether the per-vcpu upcall mask is honored by the hypervisor.
    const HAS_UPCALL_MASK: bool = true;

    fn shared_info() -> &'static SharedInfo;

    fn current_vcpu() -> usize;
}

/// Implemented by a port. Provides the monotonic clock.
pub trait PortTimer {
    /// Get the current time. Must never return `0`.
    fn now() -> Time;

    /// Convert a duration to an absolute deadline.
    fn deadline_after(duration: Duration) -> Time {
        let nanos = Time::try_from(duration.as_nanos()).unwrap_or(Time::MAX);
        Self::now().saturating_add(nanos).max(1)
    }

    /// Yield the virtual CPU to the hypervisor until `until` or until an
    /// upcall becomes pending, whichever comes first. May return early.
    fn block_domain(until: Time);
}

/// Associates a system type with its kernel state.
pub trait KernelTraits: PortThreading + PortEvents + PortTimer {
    fn state() -> &'static State<Self>;
}

/// Global kernel state.
pub struct State<Traits: KernelTraits> {
    scheduler: Scheduler<Traits>,
    events: EventChannels<Traits>,
    dispatch_policy: spin::Once<&'static dyn UpcallDispatch<Traits>>,
}

impl<Traits: KernelTraits> State<Traits> {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            events: EventChannels::new(),
            dispatch_policy: spin::Once::new(),
        }
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler<Traits> {
        &self.scheduler
    }

    #[inline]
    pub fn events(&self) -> &EventChannels<Traits> {
        &self.events
    }

    /// Replace the default upcall dispatch policy ([`ImmediateDispatch`]).
    /// This can be done only once, typically at boot.
    pub fn install_dispatch_policy(
        &self,
        policy: &'static dyn UpcallDispatch<Traits>,
    ) -> Result<(), InstallPolicyError> {
        let mut installed = false;
        self.dispatch_policy.call_once(|| {
            installed = true;
            policy
        });
        if installed {
            Ok(())
        } else {
            Err(InstallPolicyError::BadObjectState)
        }
    }

    /// Get the upcall dispatch policy in effect.
    pub fn dispatch_policy(&self) -> &'static dyn UpcallDispatch<Traits> {
        match self.dispatch_policy.get() {
            Some(policy) => *policy,
            None => &ImmediateDispatch,
        }
    }
}

impl<Traits: KernelTraits> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("scheduler", &self.scheduler)
            .field("events", &self.events)
            .field("policy_installed", &self.dispatch_policy.is_completed())
            .finish()
    }
}
