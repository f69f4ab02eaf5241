//! Cooperative round-robin scheduler
//!
//! All threads live in an arena owned by [`Scheduler`]. A live thread is a
//! member of the run queue; an exited thread waiting for reclamation is a
//! member of the exited queue. The idle thread is created by
//! [`Scheduler::init`] and stays in the run queue forever, but the
//! round-robin scan never picks it. It only runs when nothing else can.
use alloc::collections::VecDeque;
use core::{fmt, time::Duration};
use slab::Slab;

use crate::{
    error::{
        BlockThreadError, CreateThreadError, GetCurrentThreadError, InitSchedulerError,
        NoAccessError, QueryThreadError, SleepError, WakeThreadError,
    },
    klock::{lock_cpu, CpuLockCell},
    upcall::force_callback,
    KernelTraits, PortThreading, Time,
};

mod thread;
pub(crate) use self::thread::ThreadCb;
pub use self::thread::{ThreadEntry, ThreadFlags, ThreadId};

/// The longest time the idle thread blocks the domain for when no thread has
/// a deadline.
pub const IDLE_BLOCK_MAX: Duration = Duration::from_secs(10);

const IDLE_THREAD_NAME: &str = "Idle";

/// The scheduler. There is exactly one instance per system, found in
/// [`State`](crate::State).
pub struct Scheduler<Traits: PortThreading> {
    st: CpuLockCell<Traits, SchedState<Traits>>,
}

pub(crate) struct SchedState<Traits: PortThreading> {
    threads: Slab<ThreadCb<Traits>>,
    /// Arena keys of live threads, in round-robin order.
    run_queue: VecDeque<usize>,
    /// Arena keys of exited threads, most recent first.
    exited: VecDeque<usize>,
    /// The position in `run_queue` of the last thread picked by the
    /// round-robin scan.
    cursor: usize,
    current: Option<usize>,
    idle: Option<usize>,
    next_serial: u64,
}

impl<Traits: PortThreading> Scheduler<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            st: CpuLockCell::new(SchedState {
                threads: Slab::new(),
                run_queue: VecDeque::new(),
                exited: VecDeque::new(),
                cursor: 0,
                current: None,
                idle: None,
                next_serial: 0,
            }),
        }
    }
}

impl<Traits: KernelTraits> Scheduler<Traits> {
    /// Create the idle thread. This must be called exactly once before
    /// [`Self::start`].
    pub fn init(&self) -> Result<(), InitSchedulerError> {
        let mut lock = lock_cpu::<Traits>()?;
        let st = self.st.get_mut(&mut lock);
        if st.idle.is_some() {
            return Err(InitSchedulerError::BadObjectState);
        }
        let entry = ThreadEntry {
            function: idle_main::<Traits>,
            arg: 0,
        };
        let idle = st.insert(IDLE_THREAD_NAME, entry)?;
        st.idle = Some(idle);
        log::info!("Initialising scheduler");
        Ok(())
    }

    /// Dispatch the first thread. Called once from the boot context, which is
    /// abandoned.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler hasn't been initialized or has already been
    /// started.
    pub fn start(&self) -> ! {
        let context = self.elect_first();
        // Safety: We are in the boot context, which is never resumed
        unsafe { Traits::dispatch_first(context) }
    }

    /// Choose the first thread to run and make it current.
    pub(crate) fn elect_first(&self) -> Traits::Context {
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("the scheduler was started with CPU Lock active");
        };
        let st = self.st.get_mut(&mut lock);
        if st.idle.is_none() {
            panic!("no scheduler!");
        }
        if st.current.is_some() {
            panic!("the scheduler has already been started");
        }
        // Start the scan at the head of the run queue
        st.cursor = st.run_queue.len() - 1;
        let next = st.choose(Traits::now());
        st.current = Some(next);
        log::debug!("dispatching the first thread {:?}", st.threads[next].name);
        st.threads[next].context
    }

    /// Create a thread and append it to the tail of the run queue.
    pub fn create(
        &self,
        name: &'static str,
        function: fn(usize),
        arg: usize,
    ) -> Result<ThreadId, CreateThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        let st = self.st.get_mut(&mut lock);
        let index = st.insert(name, ThreadEntry { function, arg })?;
        let id = st.id_of(index);
        log::debug!("Thread {:?}: created {:?}", name, id);
        Ok(id)
    }

    /// Get the currently running thread.
    pub fn current(&self) -> Result<ThreadId, GetCurrentThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        let st = self.st.get_mut(&mut lock);
        let index = st.current.ok_or(GetCurrentThreadError::BadContext)?;
        Ok(st.id_of(index))
    }

    /// Make a thread ineligible for dispatch until [`Self::wake`] is called
    /// on it. Any pending deadline is discarded.
    ///
    /// This doesn't yield. A thread blocking itself should call
    /// [`Self::schedule`] afterwards.
    pub fn block(&self, thread: ThreadId) -> Result<(), BlockThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        let st = self.st.get_mut(&mut lock);
        let tcb = st.get_live(thread)?;
        tcb.block();
        log::trace!("Thread {:?}: blocked", tcb.name);
        Ok(())
    }

    /// Make a thread eligible for dispatch. This discards the thread's
    /// deadline, doesn't yield, and may be called from an event handler.
    pub fn wake(&self, thread: ThreadId) -> Result<(), WakeThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        let st = self.st.get_mut(&mut lock);
        let tcb = st.get(thread)?;
        if tcb.is_exited() {
            return Err(WakeThreadError::BadObjectState);
        }
        tcb.wake();
        log::trace!("Thread {:?}: woken", tcb.name);
        Ok(())
    }

    /// Put the calling thread to sleep for at least `duration` and yield.
    ///
    /// The thread resumes at the first scheduler pass at or after the
    /// deadline, or earlier if another party calls [`Self::wake`] on it.
    /// There is no upper bound on the latency.
    pub fn sleep(&self, duration: Duration) -> Result<(), SleepError> {
        if Traits::state().events().is_in_callback() {
            return Err(SleepError::BadContext);
        }
        {
            let mut lock = lock_cpu::<Traits>()?;
            let st = self.st.get_mut(&mut lock);
            let index = st.current.ok_or(SleepError::BadContext)?;
            let tcb = &mut st.threads[index];
            tcb.flags.remove(ThreadFlags::RUNNABLE);
            tcb.wakeup_time = Traits::deadline_after(duration);
        }
        self.schedule();
        Ok(())
    }

    /// Terminate the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if called by the idle thread, from an event handler, or with
    /// CPU Lock active.
    pub fn exit(&self) -> ! {
        if Traits::state().events().is_in_callback() {
            panic!("exit() called from an event handler");
        }
        self.retire_current();
        loop {
            self.schedule();
            log::error!("schedule() returned!  Trying again");
        }
    }

    /// Move the current thread from the run queue to the exited queue.
    pub(crate) fn retire_current(&self) {
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("exit() called with CPU Lock active");
        };
        let st = self.st.get_mut(&mut lock);
        let Some(index) = st.current else {
            panic!("exit() called before the scheduler was started");
        };
        if st.idle == Some(index) {
            panic!("the idle thread cannot exit");
        }
        st.unlink_from_run_queue(index);
        let tcb = &mut st.threads[index];
        tcb.flags.remove(ThreadFlags::RUNNABLE);
        tcb.flags.insert(ThreadFlags::EXITED);
        log::debug!("Thread {:?} exited", tcb.name);
        // Capacity was reserved by `insert`
        st.exited.push_front(index);
    }

    /// The dispatch entry point. Pick the next thread by round robin and
    /// switch to it, then reclaim exited threads.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler hasn't been started, if called from an event
    /// handler, or if CPU Lock is active.
    pub fn schedule(&self) {
        if Traits::state().events().is_in_callback() {
            panic!("schedule() called from an event handler");
        }
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("schedule() called with CPU Lock active");
        };
        let st = self.st.get_mut(&mut lock);
        let Some(prev) = st.current else {
            panic!("no scheduler!");
        };
        let next = st.choose(Traits::now());
        st.current = Some(next);
        let (prev_context, next_context) = (st.threads[prev].context, st.threads[next].context);

        if cfg!(feature = "sched_debug") {
            st.dump();
        }

        drop(lock);

        if prev != next {
            // Safety: `prev_context` is the calling context, and `next` was
            //         made current
            unsafe { Traits::switch_context(prev_context, next_context) };
        }

        // We might be running in a different thread now
        self.reclaim();
    }

    /// Release the storage of exited threads other than the current one.
    fn reclaim(&self) {
        loop {
            let context = {
                let Ok(mut lock) = lock_cpu::<Traits>() else {
                    return;
                };
                match self.st.get_mut(&mut lock).take_reclaimable() {
                    Some(context) => context,
                    None => return,
                }
            };
            // Safety: The thread has exited and isn't the calling context
            unsafe { Traits::destroy_context(context) };
        }
    }

    /// Called by the idle thread before it yields. Returns the deadline to
    /// block the domain until, or `None` if some thread is already eligible.
    pub(crate) fn idle_block(&self) -> Option<Time> {
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("the idle thread found CPU Lock active");
        };
        let st = self.st.get_mut(&mut lock);
        let now = Traits::now();
        let mut until = now.saturating_add(IDLE_BLOCK_MAX.as_nanos() as Time);

        if let Some(idle) = st.idle {
            st.threads[idle].block();
        }

        for &index in st.run_queue.iter() {
            if Some(index) == st.idle {
                continue;
            }
            let tcb = &st.threads[index];
            if tcb.is_runnable() {
                return None;
            }
            if tcb.wakeup_time != 0 {
                if tcb.wakeup_time <= now {
                    return None;
                }
                until = until.min(tcb.wakeup_time);
            }
        }
        Some(until)
    }

    /// Get the name of a thread.
    pub fn name(&self, thread: ThreadId) -> Result<&'static str, QueryThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.st.get_mut(&mut lock).get(thread)?.name)
    }

    /// Get a flag indicating whether a thread is currently runnable.
    pub fn is_runnable(&self, thread: ThreadId) -> Result<bool, QueryThreadError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.st.get_mut(&mut lock).get(thread)?.is_runnable())
    }

    /// Log every thread in the run queue with its runnable flag.
    pub fn dump_run_queue(&self) {
        if let Ok(lock) = lock_cpu::<Traits>() {
            self.st.get(&lock).dump();
        }
    }
}

impl<Traits: PortThreading> SchedState<Traits> {
    fn id_of(&self, index: usize) -> ThreadId {
        ThreadId {
            index,
            serial: self.threads[index].serial,
        }
    }

    fn get(&mut self, id: ThreadId) -> Result<&mut ThreadCb<Traits>, NoAccessError> {
        match self.threads.get_mut(id.index) {
            Some(tcb) if tcb.serial == id.serial => Ok(tcb),
            _ => Err(NoAccessError::NoAccess),
        }
    }

    /// Like `get`, but an exited thread is treated as nonexistent.
    fn get_live(&mut self, id: ThreadId) -> Result<&mut ThreadCb<Traits>, NoAccessError> {
        let tcb = self.get(id)?;
        if tcb.is_exited() {
            return Err(NoAccessError::NoAccess);
        }
        Ok(tcb)
    }

    /// Allocate a runnable thread and append it to the run queue.
    fn insert(&mut self, name: &'static str, entry: ThreadEntry) -> Result<usize, CreateThreadError> {
        // Reserve everything up front so that a failure leaves no trace and
        // `exit` never allocates
        self.run_queue
            .try_reserve(1)
            .map_err(|_| CreateThreadError::NoMemory)?;
        let exited_room = self.threads.len() + 1 - self.exited.len();
        self.exited
            .try_reserve(exited_room)
            .map_err(|_| CreateThreadError::NoMemory)?;

        let context = Traits::create_context(entry)?;

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        let index = self.threads.insert(ThreadCb {
            name,
            context,
            flags: ThreadFlags::RUNNABLE,
            wakeup_time: 0,
            serial,
        });
        self.run_queue.push_back(index);
        Ok(index)
    }

    /// Round-robin scan starting just past the cursor. Falls back to the idle
    /// thread.
    fn choose(&mut self, now: Time) -> usize {
        let len = self.run_queue.len();
        for step in 1..=len {
            let pos = (self.cursor + step) % len;
            let index = self.run_queue[pos];
            if Some(index) == self.idle {
                continue;
            }
            if self.threads[index].try_promote(now) {
                self.cursor = pos;
                return index;
            }
        }
        match self.idle {
            Some(idle) => idle,
            None => unreachable!("no scheduler!"),
        }
    }

    fn unlink_from_run_queue(&mut self, index: usize) {
        let Some(pos) = self.run_queue.iter().position(|&i| i == index) else {
            unreachable!("thread {index} is not in the run queue");
        };
        self.run_queue.remove(pos);
        // Keep the cursor on the element preceding the next one to visit
        if pos < self.cursor {
            self.cursor -= 1;
        } else if pos == self.cursor {
            self.cursor = pos.checked_sub(1).unwrap_or(self.run_queue.len() - 1);
        }
    }

    /// Remove an exited thread that isn't current from the arena.
    fn take_reclaimable(&mut self) -> Option<Traits::Context> {
        let current = self.current;
        let pos = self.exited.iter().position(|&i| Some(i) != current)?;
        let index = self.exited.remove(pos)?;
        let tcb = self.threads.remove(index);
        debug_assert!(tcb.is_exited());
        log::debug!("Thread {:?}: reclaimed", tcb.name);
        Some(tcb.context)
    }

    fn dump(&self) {
        log::info!("{}", RunQueueDump(self));
    }
}

/// Lists the run queue, one thread per line.
struct RunQueueDump<'a, Traits: PortThreading>(&'a SchedState<Traits>);

impl<Traits: PortThreading> fmt::Display for RunQueueDump<'_, Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.0;
        write!(f, "run queue:")?;
        for &index in st.run_queue.iter() {
            let tcb = &st.threads[index];
            write!(
                f,
                "\n   {:?}({:?}), runnable={}, wakeup_time={}",
                tcb.name,
                st.id_of(index),
                tcb.is_runnable(),
                tcb.wakeup_time
            )?;
        }
        if !st.exited.is_empty() {
            write!(f, "\nexited: {} thread(s)", st.exited.len())?;
        }
        Ok(())
    }
}

impl<Traits: PortThreading> fmt::Debug for SchedState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SchedState")
            .field("threads", &self.threads)
            .field("run_queue", &self.run_queue)
            .field("exited", &self.exited)
            .field("current", &self.current)
            .finish()
    }
}

impl<Traits: PortThreading> fmt::Debug for Scheduler<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.st).finish()
    }
}

/// Run a thread's entry function. The thread exits when it returns.
///
/// Ports call this as the body of every context created by
/// [`PortThreading::create_context`].
pub fn run_thread<Traits: KernelTraits>(entry: ThreadEntry) -> ! {
    (entry.function)(entry.arg);
    Traits::state().scheduler().exit()
}

/// The body of the idle thread.
fn idle_main<Traits: KernelTraits>(_: usize) {
    let sched = Traits::state().scheduler();
    loop {
        if let Some(until) = sched.idle_block() {
            Traits::block_domain(until);
            force_callback::<Traits>();
        }
        sched.schedule();
    }
}
