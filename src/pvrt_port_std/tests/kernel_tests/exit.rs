//! Exited threads never resume, and their storage is reclaimed by another
//! thread.
use pvrt_kernel::{KernelTraits, QueryThreadError, ThreadId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use crate::Driver;

static RETURNER: OnceLock<ThreadId> = OnceLock::new();
static EXITER: OnceLock<ThreadId> = OnceLock::new();
static RESUMED: AtomicBool = AtomicBool::new(false);

pub fn init<D: Driver>() {
    let sched = D::Traits::state().scheduler();
    RETURNER
        .set(sched.create("returner", returner, 0).unwrap())
        .unwrap();
    EXITER
        .set(sched.create("exiter", exiter::<D>, 0).unwrap())
        .unwrap();
    sched.create("observer", observer::<D>, 0).unwrap();
}

/// Exits by returning from its entry function.
fn returner(_: usize) {}

fn exiter<D: Driver>(_: usize) {
    D::Traits::state().scheduler().exit();
    #[allow(unreachable_code)]
    RESUMED.store(true, Ordering::SeqCst);
}

fn observer<D: Driver>(_: usize) {
    let sched = D::Traits::state().scheduler();
    let targets = [*RETURNER.get().unwrap(), *EXITER.get().unwrap()];

    let mut passes = 0;
    while !targets
        .iter()
        .all(|&t| sched.is_runnable(t) == Err(QueryThreadError::NoAccess))
    {
        sched.schedule();
        passes += 1;
        assert!(passes < 100, "exited threads were not reclaimed");
    }

    // Stale handles stay invalid
    assert_eq!(sched.name(targets[0]), Err(QueryThreadError::NoAccess));
    assert!(sched.block(targets[1]).is_err());
    assert!(!RESUMED.load(Ordering::SeqCst));

    // The freed slots can be reused
    let again = sched.create("again", returner, 0).unwrap();
    assert!(!targets.contains(&again));
    D::success();
}
