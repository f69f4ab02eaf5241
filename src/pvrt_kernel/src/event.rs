//! Event channel controller
use core::{
    fmt, ops,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{BadParamError, BindEventError, QueryEventError, UnbindEventError},
    klock::{lock_cpu, CpuLockCell},
    shared::{clear_bit, set_bit, test_bit, BITS_PER_WORD, NR_EVENT_CHANNELS},
    upcall::force_callback,
    KernelTraits, PortThreading,
};

/// An event channel port number.
pub type EventPort = u32;

/// A per-port event handler. Receives the port and the value supplied to
/// [`EventChannels::bind`].
pub type EventHandler = fn(EventPort, usize);

/// The number of ports that can have a handler bound.
pub const NR_EVS: usize = 1024;

/// The handler table. Formats as `(port, count)` pairs of bound ports.
struct EventActions([EventAction; NR_EVS]);

impl ops::Index<usize> for EventActions {
    type Output = EventAction;
    fn index(&self, port: usize) -> &EventAction {
        &self.0[port]
    }
}

impl ops::IndexMut<usize> for EventActions {
    fn index_mut(&mut self, port: usize) -> &mut EventAction {
        &mut self.0[port]
    }
}

impl fmt::Debug for EventActions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(
                self.0
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.handler.is_some())
                    .map(|(port, a)| (port, a.count)),
            )
            .finish()
    }
}

#[derive(Clone, Copy)]
struct EventAction {
    handler: Option<EventHandler>,
    data: usize,
    count: u64,
}

impl EventAction {
    const DEFAULT: Self = Self {
        handler: None,
        data: 0,
        count: 0,
    };
}

/// The event channel controller and the per-port handler table.
///
/// The mask and pending bitmaps are only touched with atomic bit operations
/// because the hypervisor updates them concurrently. The handler table is
/// protected by CPU Lock.
pub struct EventChannels<Traits> {
    actions: CpuLockCell<Traits, EventActions>,
    in_callback: AtomicBool,
}

impl<Traits> EventChannels<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            actions: CpuLockCell::new(EventActions([EventAction::DEFAULT; NR_EVS])),
            in_callback: AtomicBool::new(false),
        }
    }
}

impl<Traits: KernelTraits> EventChannels<Traits> {
    /// Mask every bindable port.
    pub fn init(&self) {
        let mask = Traits::shared_info().evtchn_mask();
        for port in 0..NR_EVS {
            set_bit(port, mask);
        }
    }

    /// Suppress upcalls for `port`. The pending bit is unaffected.
    ///
    /// `mask`, [`unmask`](Self::unmask), and [`acknowledge`](Self::acknowledge)
    /// ignore a port outside the shared bitmaps and log a warning.
    pub fn mask(&self, port: EventPort) {
        if let Some(port) = check_channel(port, "mask") {
            set_bit(port, Traits::shared_info().evtchn_mask());
        }
    }

    /// Allow upcalls for `port`.
    ///
    /// The hypervisor only notifies the guest when a port becomes pending. If
    /// that happened while the port was masked, this method re-raises the
    /// upcall so that the event isn't lost. The upcall is drained right away
    /// unless the virtual CPU's upcall mask is set or CPU Lock is active, in
    /// which case it's delivered when the obstruction is removed.
    pub fn unmask(&self, port: EventPort) {
        let Some(port) = check_channel(port, "unmask") else {
            return;
        };
        let shared = Traits::shared_info();

        clear_bit(port, shared.evtchn_mask());

        if !test_bit(port, shared.evtchn_pending()) {
            return;
        }

        let vcpu = shared.vcpu(Traits::current_vcpu());
        if !vcpu.claim_selector(port / BITS_PER_WORD) {
            // Someone else is already delivering this word
            return;
        }

        vcpu.set_upcall_pending();
        let unmasked = !Traits::HAS_UPCALL_MASK || vcpu.upcall_mask() == 0;
        if unmasked && !Traits::is_cpu_lock_active() {
            force_callback::<Traits>();
        }
    }

    /// Acknowledge an event on `port` by clearing its pending bit.
    pub fn acknowledge(&self, port: EventPort) {
        if let Some(port) = check_channel(port, "acknowledge") {
            clear_bit(port, Traits::shared_info().evtchn_pending());
        }
    }

    /// Install the handler for `port`, replacing any existing one. This does
    /// not unmask the port.
    pub fn bind(
        &self,
        port: EventPort,
        handler: EventHandler,
        data: usize,
    ) -> Result<EventPort, BindEventError> {
        let index = check_port(port)?;
        let mut lock = lock_cpu::<Traits>()?;
        let action = &mut self.actions.get_mut(&mut lock)[index];
        if action.handler.is_some() {
            log::warn!("Handler for port {port} already registered, replacing");
        }
        *action = EventAction {
            handler: Some(handler),
            data,
            count: 0,
        };
        Ok(port)
    }

    /// Mask and acknowledge `port` and remove its handler.
    pub fn unbind(&self, port: EventPort) -> Result<(), UnbindEventError> {
        let index = check_port(port)?;
        self.mask(port);
        self.acknowledge(port);

        let mut lock = lock_cpu::<Traits>()?;
        let action = &mut self.actions.get_mut(&mut lock)[index];
        if action.handler.is_none() {
            log::warn!("No handler for port {port} when unbinding");
        }
        *action = EventAction::DEFAULT;
        Ok(())
    }

    /// Unbind every port that has a handler.
    pub fn unbind_all(&self) -> Result<(), UnbindEventError> {
        for port in 0..NR_EVS as EventPort {
            let bound = {
                let lock = lock_cpu::<Traits>()?;
                self.actions.get(&lock)[port as usize].handler.is_some()
            };
            if bound {
                self.unbind(port)?;
            }
        }
        Ok(())
    }

    /// Get the number of times the handler of `port` has been called since it
    /// was bound.
    pub fn event_count(&self, port: EventPort) -> Result<u64, QueryEventError> {
        let index = check_port(port)?;
        let lock = lock_cpu::<Traits>()?;
        Ok(self.actions.get(&lock)[index].count)
    }

    /// Get a flag indicating whether event handlers are currently running.
    #[inline]
    pub fn is_in_callback(&self) -> bool {
        self.in_callback.load(Ordering::SeqCst)
    }

    /// Run the handlers of every port that is pending, unmasked, and selected
    /// in the current virtual CPU's selector word.
    ///
    /// [`ImmediateDispatch`](crate::ImmediateDispatch) calls this from the
    /// upcall drain loop. Users of [`DeferredDispatch`](crate::DeferredDispatch)
    /// call this at a point of their choosing.
    ///
    /// # Panics
    ///
    /// Panics if CPU Lock is active.
    pub fn dispatch_pending(&self) {
        let shared = Traits::shared_info();
        let vcpu = shared.vcpu(Traits::current_vcpu());
        let _guard = CallbackGuard::new(&self.in_callback);

        let mut sel = vcpu.take_pending_sel();
        while sel != 0 {
            let word = sel.trailing_zeros() as usize;
            sel &= sel - 1;

            loop {
                let active = shared.active_evtchns(word);
                if active == 0 {
                    break;
                }
                let bit = active.trailing_zeros() as usize;
                self.do_event(word * BITS_PER_WORD + bit);
            }
        }
    }

    fn do_event(&self, port: usize) {
        clear_bit(port, Traits::shared_info().evtchn_pending());

        if port >= NR_EVS {
            log::warn!("do_event: Port number too large: {port}");
            return;
        }

        let action = {
            let Ok(mut lock) = lock_cpu::<Traits>() else {
                panic!("event handlers dispatched with CPU Lock active");
            };
            let action = &mut self.actions.get_mut(&mut lock)[port];
            action.count += 1;
            *action
        };

        match action.handler {
            Some(handler) => handler(port as EventPort, action.data),
            None => default_handler(port as EventPort, action.data),
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for EventChannels<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventChannels")
            .field("bound", &self.actions)
            .field("in_callback", &self.in_callback)
            .finish()
    }
}

fn check_port(port: EventPort) -> Result<usize, BadParamError> {
    let index = port as usize;
    if index < NR_EVS {
        Ok(index)
    } else {
        Err(BadParamError::BadParam)
    }
}

fn check_channel(port: EventPort, op: &str) -> Option<usize> {
    let index = port as usize;
    if index < NR_EVENT_CHANNELS {
        Some(index)
    } else {
        log::warn!("{op}: port {port} out of range, ignored");
        None
    }
}

fn default_handler(port: EventPort, _data: usize) {
    log::warn!("[Port {port}] - event received");
}

/// Sets the in-callback flag for its lifetime and restores the previous value
/// on drop.
struct CallbackGuard<'a> {
    flag: &'a AtomicBool,
    was_set: bool,
}

impl<'a> CallbackGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        let was_set = flag.swap(true, Ordering::SeqCst);
        Self { flag, was_set }
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.was_set, Ordering::SeqCst);
    }
}
