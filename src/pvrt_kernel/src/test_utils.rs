//! A port that runs the kernel without switching contexts.
//!
//! `switch_context` only records the switch and returns, so a test can play
//! every thread from the test thread by calling [`Scheduler::schedule`] and
//! observing [`Scheduler::current`].
//!
//! [`Scheduler::schedule`]: crate::Scheduler::schedule
//! [`Scheduler::current`]: crate::Scheduler::current
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Mutex, MutexGuard,
};

use crate::{
    shared::{SharedInfo, UpcallAck, VcpuInfo},
    ImmediateDispatch, KernelTraits, ThreadEntry, Time, UpcallDispatch,
};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub(crate) struct MockLog {
    /// `(prev, next)` pairs passed to `switch_context`
    pub switches: Vec<(usize, usize)>,
    pub destroyed: Vec<usize>,
    pub created: Vec<(usize, ThreadEntry)>,
}

pub(crate) struct MockState {
    pub shared: SharedInfo,
    pub clock: AtomicU64,
    pub cpu_lock: AtomicBool,
    pub fail_create: AtomicBool,
    next_context: AtomicUsize,
    drains: AtomicUsize,
    log: Mutex<MockLog>,
}

impl MockState {
    pub const fn new() -> Self {
        Self {
            shared: SharedInfo::new(),
            clock: AtomicU64::new(1),
            cpu_lock: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            next_context: AtomicUsize::new(0),
            drains: AtomicUsize::new(0),
            log: Mutex::new(MockLog {
                switches: Vec::new(),
                destroyed: Vec::new(),
                created: Vec::new(),
            }),
        }
    }

    pub fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn now(&self) -> Time {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn advance(&self, nanos: Time) {
        self.clock.fetch_add(nanos, Ordering::SeqCst);
    }

    /// The number of drain passes run by [`CountingDispatch`].
    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub fn alloc_context(&self, entry: ThreadEntry) -> usize {
        let ctx = self.next_context.fetch_add(1, Ordering::SeqCst);
        self.log().created.push((ctx, entry));
        ctx
    }
}

pub(crate) trait MockTraits: KernelTraits {
    fn mock() -> &'static MockState;
}

/// Counts drain passes, then does what [`ImmediateDispatch`] does.
pub(crate) struct CountingDispatch;

impl<Traits: MockTraits> UpcallDispatch<Traits> for CountingDispatch {
    fn dispatch(&self, vcpu: &VcpuInfo) -> UpcallAck {
        Traits::mock().drains.fetch_add(1, Ordering::SeqCst);
        <ImmediateDispatch as UpcallDispatch<Traits>>::dispatch(&ImmediateDispatch, vcpu)
    }
}

/// Define a system type backed by its own [`MockState`] and kernel state.
///
/// `has_upcall_mask: false` models a port without a per-vCPU upcall mask.
macro_rules! mock_port {
    (struct $Sys:ident $(, has_upcall_mask: $has_mask:expr)?) => {
        struct $Sys;

        impl $Sys {
            #[allow(dead_code)]
            fn mock() -> &'static $crate::test_utils::MockState {
                static MOCK: $crate::test_utils::MockState = $crate::test_utils::MockState::new();
                &MOCK
            }

            /// Install `CountingDispatch` so that `mock().drains()` works.
            #[allow(dead_code)]
            fn count_drains() {
                <$Sys as $crate::KernelTraits>::state()
                    .install_dispatch_policy(&$crate::test_utils::CountingDispatch)
                    .unwrap();
            }
        }

        impl $crate::test_utils::MockTraits for $Sys {
            fn mock() -> &'static $crate::test_utils::MockState {
                $Sys::mock()
            }
        }

        unsafe impl $crate::PortThreading for $Sys {
            type Context = usize;

            fn create_context(
                entry: $crate::ThreadEntry,
            ) -> Result<usize, $crate::CreateThreadError> {
                let mock = $Sys::mock();
                if mock.fail_create.load(::std::sync::atomic::Ordering::SeqCst) {
                    return Err($crate::CreateThreadError::NoMemory);
                }
                Ok(mock.alloc_context(entry))
            }

            unsafe fn switch_context(prev: usize, next: usize) {
                $Sys::mock().log().switches.push((prev, next));
            }

            unsafe fn dispatch_first(_: usize) -> ! {
                unreachable!("the mock port can't transfer control");
            }

            unsafe fn destroy_context(ctx: usize) {
                $Sys::mock().log().destroyed.push(ctx);
            }

            unsafe fn enter_cpu_lock() {
                $Sys::mock()
                    .cpu_lock
                    .store(true, ::std::sync::atomic::Ordering::SeqCst);
            }

            unsafe fn try_enter_cpu_lock() -> bool {
                !$Sys::mock()
                    .cpu_lock
                    .swap(true, ::std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn leave_cpu_lock() {
                let mock = $Sys::mock();
                mock.cpu_lock
                    .store(false, ::std::sync::atomic::Ordering::SeqCst);

                // Interrupts are enabled again; take a pending upcall
                let vcpu = mock.shared.vcpu(0);
                let unmasked = !<$Sys as $crate::PortEvents>::HAS_UPCALL_MASK
                    || vcpu.upcall_mask() == 0;
                if vcpu.upcall_pending() && unmasked {
                    $crate::force_callback::<$Sys>();
                }
            }

            fn is_cpu_lock_active() -> bool {
                $Sys::mock()
                    .cpu_lock
                    .load(::std::sync::atomic::Ordering::SeqCst)
            }
        }

        unsafe impl $crate::PortEvents for $Sys {
            $(const HAS_UPCALL_MASK: bool = $has_mask;)?

            fn shared_info() -> &'static $crate::shared::SharedInfo {
                &$Sys::mock().shared
            }

            fn current_vcpu() -> usize {
                0
            }
        }

        impl $crate::PortTimer for $Sys {
            fn now() -> $crate::Time {
                $Sys::mock().now()
            }

            fn block_domain(until: $crate::Time) {
                // Let time pass up to the deadline
                $Sys::mock()
                    .clock
                    .fetch_max(until, ::std::sync::atomic::Ordering::SeqCst);
            }
        }

        impl $crate::KernelTraits for $Sys {
            fn state() -> &'static $crate::State<Self> {
                static STATE: $crate::State<$Sys> = $crate::State::new();
                &STATE
            }
        }
    };
}
