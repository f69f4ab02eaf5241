#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use atomic_ref::AtomicRef;
use pvrt_kernel::{
    force_callback, CreateThreadError, EventPort, KernelTraits, PortThreading, ThreadEntry, Time,
};
use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

mod hypervisor;
mod ums;

pub use self::{hypervisor::Hypervisor, ums::ThreadId};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate pvrt_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// The virtual CPU every guest thread runs on.
pub const BOOT_VCPU: usize = 0;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits + PortThreading<Context = ThreadId> {
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    thread_group: ums::ThreadGroup,
    cpu_lock: AtomicBool,
    hypervisor: Hypervisor,
    origin: AtomicRef<'static, Instant>,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The worker thread running the boot phase.
    Boot,
    /// The backing thread of a guest thread, including the idle thread.
    Guest,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            thread_group: ums::ThreadGroup::new(),
            cpu_lock: AtomicBool::new(false),
            hypervisor: Hypervisor::new(),
            origin: AtomicRef::new(None),
        }
    }

    #[inline]
    pub fn hypervisor(&self) -> &Hypervisor {
        &self.hypervisor
    }

    /// Boot the guest and run it until [`shutdown`] or [`request_shutdown`].
    ///
    /// `init` runs in the boot context after the kernel is initialized and
    /// before the first thread is dispatched. This is where the application
    /// creates its threads and binds its event channels.
    ///
    /// A panic in any guest thread is propagated to the caller.
    pub fn port_boot<Traits: PortInstance>(&'static self, init: fn()) {
        let _ = env_logger::try_init();

        // Fix the time origin before anything reads the clock
        self.now::<Traits>();

        let boot = self
            .thread_group
            .spawn(move |_| {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
                let state = Traits::state();

                state.events().init();
                if let Err(e) = state.scheduler().init() {
                    panic!("failed to initialize the scheduler: {e:?}");
                }

                init();

                state.scheduler().start()
            })
            .unwrap_or_else(|e| panic!("failed to spawn the boot thread: {e}"));
        log::trace!("boot thread = {boot:?}");

        self.thread_group.start(boot);

        // Wait until the guest shuts down
        let result = self.thread_group.join();
        log::trace!("the guest has shut down");

        // Propagate any panic that occured in a worker thread
        if let Err(e) = result {
            std::panic::resume_unwind(e);
        }
    }

    pub fn create_context<Traits: PortInstance>(
        &'static self,
        entry: ThreadEntry,
    ) -> Result<ThreadId, CreateThreadError> {
        expect_worker_thread();
        let thread = self
            .thread_group
            .spawn(move |_| {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Guest));
                assert!(!self.is_cpu_lock_active::<Traits>());
                pvrt_kernel::run_thread::<Traits>(entry)
            })
            .map_err(|e| {
                log::warn!("failed to spawn a worker thread: {e}");
                CreateThreadError::NoMemory
            })?;
        log::trace!("create_context({entry:?}) = {thread:?}");
        Ok(thread)
    }

    pub unsafe fn switch_context<Traits: PortInstance>(&self, prev: ThreadId, next: ThreadId) {
        log::trace!("switch_context({prev:?}, {next:?})");
        assert_eq!(expect_worker_thread(), ThreadRole::Guest);
        assert!(!self.is_cpu_lock_active::<Traits>());
        self.thread_group.switch(prev, next);
    }

    pub unsafe fn dispatch_first<Traits: PortInstance>(&self, next: ThreadId) -> ! {
        log::trace!("dispatch_first({next:?})");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);
        assert!(!self.is_cpu_lock_active::<Traits>());

        // The boot context is discarded
        self.thread_group.hand_over(next)
    }

    pub unsafe fn destroy_context<Traits: PortInstance>(&self, ctx: ThreadId) {
        log::trace!("destroy_context({ctx:?})");
        expect_worker_thread();
        self.thread_group.reclaim(ctx);
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        expect_worker_thread();
        let was_active = self.cpu_lock.swap(true, Ordering::SeqCst);
        assert!(!was_active);
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();
        !self.cpu_lock.swap(true, Ordering::SeqCst)
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&self) {
        expect_worker_thread();
        let was_active = self.cpu_lock.swap(false, Ordering::SeqCst);
        assert!(was_active);

        // An upcall that arrived while CPU Lock was active is taken here
        let vcpu = self.hypervisor.shared_info().vcpu(BOOT_VCPU);
        let unmasked = !Traits::HAS_UPCALL_MASK || vcpu.upcall_mask() == 0;
        if vcpu.upcall_pending() && unmasked {
            force_callback::<Traits>();
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        self.cpu_lock.load(Ordering::SeqCst)
    }

    pub fn now<Traits: PortInstance>(&self) -> Time {
        let origin = if let Some(x) = self.origin.load(Ordering::Acquire) {
            x
        } else {
            let origin = Box::leak(Box::new(Instant::now()));

            // Whoever stores first defines the origin. The loser leaks one
            // `Instant`.
            match self
                .origin
                .compare_exchange(None, Some(origin), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => origin,
                Err(x) => x.unwrap_or(origin),
            }
        };

        let nanos = Instant::now().duration_since(*origin).as_nanos();

        // `0` means "no deadline"
        Time::try_from(nanos).unwrap_or(Time::MAX).saturating_add(1)
    }

    pub fn block_domain<Traits: PortInstance>(&self, until: Time) {
        assert_eq!(expect_worker_thread(), ThreadRole::Guest);
        let wait = Duration::from_nanos(until.saturating_sub(self.now::<Traits>()));
        log::trace!("block_domain({wait:?})");

        let group = &self.thread_group;
        self.hypervisor
            .block_until(BOOT_VCPU, Instant::now() + wait, || group.is_shutting_down());

        if group.is_shutting_down() {
            ums::exit_thread();
        }
    }

    fn shutdown(&self) {
        log::debug!("shutting down");
        self.thread_group.shutdown();
        self.hypervisor.notify();
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert that the current thread is a worker thread.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown);
    role
}

/// Boot the guest system `Traits`. See [`State::port_boot`].
pub fn boot<Traits: PortInstance>(init: fn()) {
    Traits::port_state().port_boot::<Traits>(init);
}

/// Shut down the guest from one of its threads. The calling thread never
/// resumes, and [`boot`] returns once every thread has terminated.
///
/// Note: There is no safe way to restart the simulated system without
/// restarting an entire process.
pub fn shutdown<Traits: PortInstance>() -> ! {
    expect_worker_thread();
    Traits::port_state().shutdown();
    ums::exit_thread()
}

/// Initiate shutdown from a thread outside the guest.
pub fn request_shutdown<Traits: PortInstance>() {
    assert_eq!(
        THREAD_ROLE.with(|r| r.get()),
        ThreadRole::Unknown,
        "this function cannot be called from a port-managed thread; use `shutdown` instead"
    );
    Traits::port_state().shutdown();
}

/// Signal an event channel as the hypervisor would. Returns `true` if this
/// raised a new upcall.
///
/// This can be called from any thread. A guest thread doing so models an
/// event sent to itself, which is delivered the next time CPU Lock is left or
/// the domain blocks.
pub fn send_event<Traits: PortInstance>(port: EventPort) -> bool {
    log::trace!("send_event({port})");
    Traits::port_state().hypervisor.send(port, BOOT_VCPU)
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::pvrt_kernel::{
                shared::SharedInfo, CreateThreadError, KernelTraits, PortEvents, PortThreading,
                PortTimer, ThreadEntry, Time,
            };
            use $crate::{BOOT_VCPU, PortInstance, State, ThreadId};

            pub(super) static PORT_STATE: State = State::new();
            pub(super) static KERNEL_STATE: $crate::pvrt_kernel::State<$SystemTraits> =
                $crate::pvrt_kernel::State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            impl KernelTraits for $SystemTraits {
                #[inline]
                fn state() -> &'static $crate::pvrt_kernel::State<Self> {
                    &KERNEL_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type Context = ThreadId;

                fn create_context(entry: ThreadEntry) -> Result<ThreadId, CreateThreadError> {
                    PORT_STATE.create_context::<Self>(entry)
                }

                unsafe fn switch_context(prev: ThreadId, next: ThreadId) {
                    unsafe { PORT_STATE.switch_context::<Self>(prev, next) }
                }

                unsafe fn dispatch_first(next: ThreadId) -> ! {
                    unsafe { PORT_STATE.dispatch_first::<Self>(next) }
                }

                unsafe fn destroy_context(ctx: ThreadId) {
                    unsafe { PORT_STATE.destroy_context::<Self>(ctx) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }
            }

            unsafe impl PortEvents for $SystemTraits {
                fn shared_info() -> &'static SharedInfo {
                    PORT_STATE.hypervisor().shared_info()
                }

                fn current_vcpu() -> usize {
                    BOOT_VCPU
                }
            }

            impl PortTimer for $SystemTraits {
                fn now() -> Time {
                    PORT_STATE.now::<Self>()
                }

                fn block_domain(until: Time) {
                    PORT_STATE.block_domain::<Self>(until)
                }
            }
        }
    };
}
