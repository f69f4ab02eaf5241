//! With `DeferredDispatch` installed, upcalls are only acknowledged and the
//! handlers run when the guest calls `dispatch_pending`.
use pvrt_kernel::{DeferredDispatch, EventPort, KernelTraits, PortEvents};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Driver;

const PORT: EventPort = 3;

static HITS: AtomicUsize = AtomicUsize::new(0);

pub fn init<D: Driver>() {
    let state = D::Traits::state();
    state.install_dispatch_policy(&DeferredDispatch).unwrap();
    state.scheduler().create("task", task::<D>, 0).unwrap();

    let events = state.events();
    events.bind(PORT, on_event, 0).unwrap();
    events.unmask(PORT);
}

fn on_event(_: EventPort, _: usize) {
    HITS.fetch_add(1, Ordering::SeqCst);
}

fn task<D: Driver>(_: usize) {
    let state = D::Traits::state();
    let vcpu = D::Traits::shared_info().vcpu(0);

    assert!(pvrt_port_std::send_event::<D::Traits>(PORT));

    // Leaving CPU Lock takes the upcall
    state.scheduler().current().unwrap();
    assert!(!vcpu.upcall_pending());
    assert_eq!(HITS.load(Ordering::SeqCst), 0);

    state.events().dispatch_pending();
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
    assert_eq!(state.events().event_count(PORT), Ok(1));

    D::success();
}
