//! A sleeping thread resumes no earlier than its deadline, and a thread
//! that slept the longest resumes last.
use pvrt_kernel::{KernelTraits, PortTimer};
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::Driver;

static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

pub fn init<D: Driver>() {
    let sched = D::Traits::state().scheduler();
    sched.create("long", long::<D>, 0).unwrap();
    sched.create("short", short::<D>, 0).unwrap();
}

fn short<D: Driver>(_: usize) {
    let sched = D::Traits::state().scheduler();

    // A zero-length sleep is just a yield
    sched.sleep(Duration::ZERO).unwrap();

    let start = Instant::now();
    let start_time = D::Traits::now();
    sched.sleep(Duration::from_millis(50)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(D::Traits::now() - start_time >= 50_000_000);

    TRACE.lock().unwrap().push("short");
}

fn long<D: Driver>(_: usize) {
    let sched = D::Traits::state().scheduler();

    let start = Instant::now();
    sched.sleep(Duration::from_millis(150)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));

    TRACE.lock().unwrap().push("long");
    assert_eq!(*TRACE.lock().unwrap(), ["short", "long"]);
    D::success();
}
