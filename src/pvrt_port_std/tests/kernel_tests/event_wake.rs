//! A blocked thread is woken by the handler of an event signaled from
//! outside the guest. The idle thread blocks the domain in the meantime.
use pvrt_kernel::{EventPort, KernelTraits, ThreadId};
use std::{sync::OnceLock, thread, time::Duration};

use crate::Driver;

const PORT: EventPort = 7;

static WAITER: OnceLock<ThreadId> = OnceLock::new();

pub fn init<D: Driver>() {
    let sched = D::Traits::state().scheduler();
    let waiter = sched.create("waiter", waiter::<D>, 0).unwrap();
    WAITER.set(waiter).unwrap();

    let events = D::Traits::state().events();
    events.bind(PORT, on_event::<D>, 42).unwrap();
    events.unmask(PORT);
}

fn on_event<D: Driver>(port: EventPort, data: usize) {
    assert_eq!((port, data), (PORT, 42));
    let sched = D::Traits::state().scheduler();
    sched.wake(*WAITER.get().unwrap()).unwrap();
}

fn waiter<D: Driver>(_: usize) {
    let state = D::Traits::state();
    let sched = state.scheduler();
    let me = sched.current().unwrap();
    assert_eq!(Some(&me), WAITER.get());

    thread::spawn(|| {
        thread::sleep(Duration::from_millis(50));
        pvrt_port_std::send_event::<D::Traits>(PORT);
    });

    sched.block(me).unwrap();
    sched.schedule();

    // Only the handler could have made us runnable again
    assert_eq!(state.events().event_count(PORT), Ok(1));
    assert_eq!(sched.is_runnable(me), Ok(true));
    D::success();
}
