//! Upcall drain loop
use crate::{
    shared::{barrier, UpcallAck, VcpuInfo},
    KernelTraits,
};

/// Decides what one pass of the upcall drain loop does.
///
/// Every pass must acknowledge the upcall (which is proven by the returned
/// [`UpcallAck`]). The drain loop keeps running passes while the
/// upcall-pending flag is set, so an event signaled during a pass is caught by
/// the next one.
pub trait UpcallDispatch<Traits: KernelTraits>: Sync {
    fn dispatch(&self, vcpu: &VcpuInfo) -> UpcallAck;
}

/// Run the handlers of pending ports from within the drain loop. This is the
/// default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateDispatch;

impl<Traits: KernelTraits> UpcallDispatch<Traits> for ImmediateDispatch {
    fn dispatch(&self, vcpu: &VcpuInfo) -> UpcallAck {
        let ack = vcpu.acknowledge_upcall();
        barrier();
        Traits::state().events().dispatch_pending();
        ack
    }
}

/// Only acknowledge the upcall. Pending ports stay pending and selected until
/// [`EventChannels::dispatch_pending`] is called.
///
/// [`EventChannels::dispatch_pending`]: crate::EventChannels::dispatch_pending
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredDispatch;

impl<Traits: KernelTraits> UpcallDispatch<Traits> for DeferredDispatch {
    fn dispatch(&self, vcpu: &VcpuInfo) -> UpcallAck {
        vcpu.acknowledge_upcall()
    }
}

/// Drain the upcalls pending on the current virtual CPU.
///
/// The virtual CPU's upcall mask is raised for the duration of each pass and
/// then restored to the value it had on entry.
pub fn force_callback<Traits: KernelTraits>() {
    let vcpu = Traits::shared_info().vcpu(Traits::current_vcpu());
    let policy = Traits::state().dispatch_policy();
    let save = vcpu.upcall_mask();
    let mut passes = 0usize;

    while vcpu.upcall_pending() {
        if Traits::HAS_UPCALL_MASK {
            vcpu.set_upcall_mask(1);
        }
        barrier();
        let _: UpcallAck = policy.dispatch(vcpu);
        barrier();
        if Traits::HAS_UPCALL_MASK {
            vcpu.set_upcall_mask(save);
            barrier();
        }
        passes += 1;
    }

    if passes > 0 {
        log::trace!("upcall drained in {passes} pass(es)");
    }
}
