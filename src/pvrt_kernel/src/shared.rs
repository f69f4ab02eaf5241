//! The page shared between the guest and the hypervisor
//!
//! Every field here may be written concurrently by the hypervisor, so all of
//! them are atomics and every bit operation is a full-barrier read-modify-write.
use core::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};

/// The number of virtual CPU slots in [`SharedInfo`].
pub const MAX_VIRT_CPUS: usize = 32;

/// The width of a bitmap word.
pub const BITS_PER_WORD: usize = usize::BITS as usize;

/// The number of words in each event channel bitmap. The selector word in
/// [`VcpuInfo`] has one bit per word, which bounds this value.
pub const EVTCHN_WORDS: usize = BITS_PER_WORD;

/// The number of event channel ports representable by the bitmaps.
pub const NR_EVENT_CHANNELS: usize = EVTCHN_WORDS * BITS_PER_WORD;

/// Per-virtual-CPU upcall state.
#[repr(C)]
#[derive(Debug)]
pub struct VcpuInfo {
    evtchn_upcall_pending: AtomicU8,
    evtchn_upcall_mask: AtomicU8,
    evtchn_pending_sel: AtomicUsize,
}

/// The shared info page.
#[repr(C)]
#[derive(Debug)]
pub struct SharedInfo {
    vcpu_info: [VcpuInfo; MAX_VIRT_CPUS],
    evtchn_pending: [AtomicUsize; EVTCHN_WORDS],
    evtchn_mask: [AtomicUsize; EVTCHN_WORDS],
}

/// Proof that the upcall-pending flag of a virtual CPU was cleared.
///
/// Only [`VcpuInfo::acknowledge_upcall`] can produce this, and an
/// [`UpcallDispatch`] implementation must return one.
///
/// [`UpcallDispatch`]: crate::UpcallDispatch
#[must_use = "a dispatch policy must return the acknowledgement"]
#[derive(Debug)]
pub struct UpcallAck {
    _private: (),
}

/// Test bit `bit` of the bitmap `words`.
///
/// # Panics
///
/// This function and the other bit operations panic if `bit` lies outside
/// `words`.
#[inline]
pub fn test_bit(bit: usize, words: &[AtomicUsize]) -> bool {
    let (i, mask) = split_bit(bit);
    words[i].load(Ordering::SeqCst) & mask != 0
}

/// Set bit `bit` of the bitmap `words`.
#[inline]
pub fn set_bit(bit: usize, words: &[AtomicUsize]) {
    let (i, mask) = split_bit(bit);
    words[i].fetch_or(mask, Ordering::SeqCst);
}

/// Clear bit `bit` of the bitmap `words`.
#[inline]
pub fn clear_bit(bit: usize, words: &[AtomicUsize]) {
    let (i, mask) = split_bit(bit);
    words[i].fetch_and(!mask, Ordering::SeqCst);
}

/// Set bit `bit` of the bitmap `words` and return its old value.
#[inline]
pub fn test_and_set_bit(bit: usize, words: &[AtomicUsize]) -> bool {
    let (i, mask) = split_bit(bit);
    words[i].fetch_or(mask, Ordering::SeqCst) & mask != 0
}

/// Full memory barrier.
#[inline]
pub fn barrier() {
    fence(Ordering::SeqCst);
}

#[inline]
fn split_bit(bit: usize) -> (usize, usize) {
    (bit / BITS_PER_WORD, 1 << (bit % BITS_PER_WORD))
}

impl VcpuInfo {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        evtchn_upcall_pending: AtomicU8::new(0),
        evtchn_upcall_mask: AtomicU8::new(0),
        evtchn_pending_sel: AtomicUsize::new(0),
    };

    #[inline]
    pub fn upcall_pending(&self) -> bool {
        self.evtchn_upcall_pending.load(Ordering::SeqCst) != 0
    }

    #[inline]
    pub fn set_upcall_pending(&self) {
        self.evtchn_upcall_pending.store(1, Ordering::SeqCst);
    }

    /// Clear the upcall-pending flag.
    #[inline]
    pub fn acknowledge_upcall(&self) -> UpcallAck {
        self.evtchn_upcall_pending.store(0, Ordering::SeqCst);
        UpcallAck { _private: () }
    }

    /// Get the upcall mask. A nonzero value suppresses upcalls.
    #[inline]
    pub fn upcall_mask(&self) -> u8 {
        self.evtchn_upcall_mask.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_upcall_mask(&self, value: u8) {
        self.evtchn_upcall_mask.store(value, Ordering::SeqCst);
    }

    /// Set selector bit `word` and return `true` if it was clear.
    #[inline]
    pub fn claim_selector(&self, word: usize) -> bool {
        debug_assert!(word < EVTCHN_WORDS);
        let mask = 1usize << word;
        self.evtchn_pending_sel.fetch_or(mask, Ordering::SeqCst) & mask == 0
    }

    /// Read and clear the selector word.
    #[inline]
    pub fn take_pending_sel(&self) -> usize {
        self.evtchn_pending_sel.swap(0, Ordering::SeqCst)
    }

    #[inline]
    pub fn pending_sel(&self) -> usize {
        self.evtchn_pending_sel.load(Ordering::SeqCst)
    }
}

impl SharedInfo {
    /// Construct a `SharedInfo` with every flag and bitmap cleared.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            vcpu_info: [VcpuInfo::INIT; MAX_VIRT_CPUS],
            evtchn_pending: [ZERO; EVTCHN_WORDS],
            evtchn_mask: [ZERO; EVTCHN_WORDS],
        }
    }

    /// Get the upcall state of the virtual CPU `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= MAX_VIRT_CPUS`.
    #[inline]
    pub fn vcpu(&self, i: usize) -> &VcpuInfo {
        &self.vcpu_info[i]
    }

    #[inline]
    pub fn evtchn_pending(&self) -> &[AtomicUsize] {
        &self.evtchn_pending
    }

    #[inline]
    pub fn evtchn_mask(&self) -> &[AtomicUsize] {
        &self.evtchn_mask
    }

    /// Get the bits of word `word` that are pending and not masked.
    #[inline]
    pub fn active_evtchns(&self, word: usize) -> usize {
        self.evtchn_pending[word].load(Ordering::SeqCst)
            & !self.evtchn_mask[word].load(Ordering::SeqCst)
    }

    /// Deliver an event on `port` to the virtual CPU `vcpu` the way the
    /// hypervisor does.
    ///
    /// The port becomes pending. Unless the port is masked, its selector bit
    /// and the upcall-pending flag are set as well. Returns `true` if the
    /// upcall-pending flag was raised by this call, which means the guest
    /// should be notified.
    ///
    /// A port outside the bitmaps is ignored with a warning.
    pub fn raise_event(&self, port: usize, vcpu: usize) -> bool {
        if port >= NR_EVENT_CHANNELS {
            log::warn!("raise_event: port {port} out of range, ignored");
            return false;
        }
        if test_and_set_bit(port, &self.evtchn_pending) {
            return false;
        }
        if test_bit(port, &self.evtchn_mask) {
            return false;
        }
        let v = self.vcpu(vcpu);
        v.claim_selector(port / BITS_PER_WORD);
        let was_pending = v.evtchn_upcall_pending.swap(1, Ordering::SeqCst) != 0;
        !was_pending
    }
}

impl Default for SharedInfo {
    fn default() -> Self {
        Self::new()
    }
}
