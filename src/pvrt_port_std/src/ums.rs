//! Cooperative user-mode scheduling on host threads
//!
//! Every guest execution context is backed by a host thread. A *baton* decides
//! which one may run; all others wait on a condition variable until they
//! receive it, are reclaimed, or the group shuts down.
use slab::Slab;
use std::{
    any::Any,
    cell::Cell,
    fmt, io,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard},
    thread,
};


/// Identifies a worker thread in a [`ThreadGroup`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// A set of worker threads of which at most one runs at a time.
pub struct ThreadGroup {
    st: Mutex<GroupState>,
    cond: Condvar,
}

struct GroupState {
    /// The thread holding the baton
    running: Option<ThreadId>,
    workers: Slab<WorkerState>,
    shutdown: bool,
    /// The first panic that escaped a worker
    panic: Option<Box<dyn Any + Send>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Live,
    /// The worker must exit the next time it wakes up.
    Reclaimed,
}

/// The unwinding payload used by [`exit_thread`].
struct ExitThread;

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = Cell::new(None);
}

/// Get the worker thread running on the calling host thread.
pub fn current_thread() -> Option<ThreadId> {
    CURRENT.with(|c| c.get())
}

/// Terminate the calling worker thread.
///
/// The thread's stack is unwound, so the caller must make sure nothing on the
/// stack minds being dropped at this point.
pub fn exit_thread() -> ! {
    resume_unwind(Box::new(ExitThread));
}

impl ThreadGroup {
    pub const fn new() -> Self {
        Self {
            st: Mutex::new(GroupState {
                running: None,
                workers: Slab::new(),
                shutdown: false,
                panic: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        // A worker never panics while holding the lock
        self.st.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a worker thread. It doesn't run until it receives the baton.
    pub fn spawn(
        &'static self,
        f: impl FnOnce(ThreadId) + Send + 'static,
    ) -> io::Result<ThreadId> {
        let mut st = self.lock();
        let entry = st.workers.vacant_entry();
        let id = ThreadId(entry.key());

        thread::Builder::new()
            .name(format!("worker {}", id.0))
            .spawn(move || self.worker_main(id, f))?;

        entry.insert(WorkerState::Live);
        log::trace!("spawned {id:?}");
        Ok(id)
    }

    fn worker_main(&'static self, id: ThreadId, f: impl FnOnce(ThreadId)) {
        CURRENT.with(|c| c.set(Some(id)));

        let result = catch_unwind(AssertUnwindSafe(|| {
            if self.wait_for_baton(self.lock(), id).is_ok() {
                f(id);
            }
        }));

        let mut st = self.lock();
        match result {
            Ok(()) => {}
            Err(e) if e.is::<ExitThread>() => {}
            Err(e) => {
                log::error!("{id:?} panicked; shutting down");
                if st.panic.is_none() {
                    st.panic = Some(e);
                }
                st.shutdown = true;
            }
        }
        if st.running == Some(id) {
            st.running = None;
        }
        st.workers.remove(id.0);
        log::trace!("{id:?} finished");
        self.cond.notify_all();
    }

    /// Block until `id` holds the baton. Fails if the thread must exit
    /// instead.
    fn wait_for_baton(
        &self,
        mut st: MutexGuard<'_, GroupState>,
        id: ThreadId,
    ) -> Result<(), ExitThread> {
        loop {
            if st.shutdown || st.workers.get(id.0) != Some(&WorkerState::Live) {
                return Err(ExitThread);
            }
            if st.running == Some(id) {
                return Ok(());
            }
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Give the baton to `id`. Used to start the first worker.
    pub fn start(&self, id: ThreadId) {
        let mut st = self.lock();
        assert_eq!(st.running, None, "the thread group is already running");
        st.running = Some(id);
        self.cond.notify_all();
    }

    /// Pass the baton from the calling worker `from` to `to` and block until
    /// it comes back.
    pub fn switch(&self, from: ThreadId, to: ThreadId) {
        debug_assert_eq!(current_thread(), Some(from));
        let mut st = self.lock();
        debug_assert_eq!(st.running, Some(from));
        st.running = Some(to);
        self.cond.notify_all();

        if self.wait_for_baton(st, from).is_err() {
            exit_thread();
        }
    }

    /// Pass the baton to `to` and terminate the calling worker.
    pub fn hand_over(&self, to: ThreadId) -> ! {
        {
            let mut st = self.lock();
            st.running = Some(to);
            self.cond.notify_all();
        }
        exit_thread();
    }

    /// Make a worker that is waiting for the baton exit.
    pub fn reclaim(&self, id: ThreadId) {
        let mut st = self.lock();
        assert_ne!(st.running, Some(id), "can't reclaim the running thread");
        if let Some(worker) = st.workers.get_mut(id.0) {
            *worker = WorkerState::Reclaimed;
        }
        self.cond.notify_all();
    }

    /// Make every worker exit the next time it waits for the baton.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Wait until every worker has finished. Returns the first panic that
    /// escaped a worker.
    pub fn join(&self) -> Result<(), Box<dyn Any + Send>> {
        let mut st = self.lock();
        while !st.workers.is_empty() {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        match st.panic.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}
