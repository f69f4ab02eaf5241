//! An event signaled while its port is masked is delivered when the port is
//! unmasked.
use pvrt_kernel::{shared, EventPort, KernelTraits, PortEvents};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Driver;

const PORT: EventPort = 9;

static HITS: AtomicUsize = AtomicUsize::new(0);

pub fn init<D: Driver>() {
    let sched = D::Traits::state().scheduler();
    sched.create("task", task::<D>, 0).unwrap();
    D::Traits::state()
        .events()
        .bind(PORT, on_event, 0)
        .unwrap();
}

fn on_event(_: EventPort, _: usize) {
    HITS.fetch_add(1, Ordering::SeqCst);
}

fn task<D: Driver>(_: usize) {
    let events = D::Traits::state().events();
    let info = D::Traits::shared_info();

    // Ports start masked, so this doesn't raise an upcall
    assert!(!pvrt_port_std::send_event::<D::Traits>(PORT));
    assert!(shared::test_bit(PORT as usize, info.evtchn_pending()));
    assert!(!info.vcpu(0).upcall_pending());
    assert_eq!(HITS.load(Ordering::SeqCst), 0);

    // Unmasking re-raises the upcall, which is drained right away
    events.unmask(PORT);
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
    assert!(!shared::test_bit(PORT as usize, info.evtchn_pending()));
    assert_eq!(events.event_count(PORT), Ok(1));

    // Masking again holds off further events
    events.mask(PORT);
    assert!(!pvrt_port_std::send_event::<D::Traits>(PORT));
    events.unmask(PORT);
    assert_eq!(HITS.load(Ordering::SeqCst), 2);

    D::success();
}
