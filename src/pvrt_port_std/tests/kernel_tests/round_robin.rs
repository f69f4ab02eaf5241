//! Threads that keep yielding run in creation order, and the idle thread is
//! skipped while any of them is runnable.
use pvrt_kernel::KernelTraits;
use std::sync::Mutex;

use crate::Driver;

const ROUNDS: usize = 3;

static TRACE: Mutex<String> = Mutex::new(String::new());

pub fn init<D: Driver>() {
    let sched = D::Traits::state().scheduler();
    for (name, letter) in [("A", 'A'), ("B", 'B'), ("C", 'C')] {
        sched.create(name, worker::<D>, letter as usize).unwrap();
    }
}

fn worker<D: Driver>(letter: usize) {
    let sched = D::Traits::state().scheduler();
    let letter = char::from_u32(letter as u32).unwrap();

    for _ in 0..ROUNDS {
        let len = {
            let mut trace = TRACE.lock().unwrap();
            trace.push(letter);
            trace.len()
        };

        if len == ROUNDS * 3 {
            assert_eq!(*TRACE.lock().unwrap(), "ABCABCABC");
            D::success();
        }

        sched.schedule();
    }
}
