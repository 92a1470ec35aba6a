use crate::network::core::address::{Address, ADDRESS_SIZE};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Caller buffers moved into an operation and handed back with its result.
#[derive(Debug, Default)]
pub struct Buffers {
    pub packet: Vec<u8>,
    pub addresses: Vec<Address>,
}

impl Buffers {
    pub fn new(packet: Vec<u8>, addresses: Vec<Address>) -> Self {
        Self { packet, addresses }
    }
}

/// Resources owned by one native call while it is in flight.
///
/// The buffers are heap allocations owned by the slot, so the driver can
/// write through the pointers taken at submission without them moving.
#[derive(Debug)]
pub struct OperationSlot {
    buffers: Buffers,
    token: Option<CancellationToken>,
}

impl OperationSlot {
    pub fn new(buffers: Buffers, token: Option<CancellationToken>) -> Self {
        Self { buffers, token }
    }

    pub fn packet_ptr(&mut self) -> *mut u8 {
        self.buffers.packet.as_mut_ptr()
    }

    pub fn packet_len(&self) -> u32 {
        u32::try_from(self.buffers.packet.len()).unwrap_or(u32::MAX)
    }

    pub fn addresses_ptr(&mut self) -> *mut Address {
        self.buffers.addresses.as_mut_ptr()
    }

    /// Size of the address buffer in bytes.
    pub fn addresses_len(&self) -> u32 {
        (self.buffers.addresses.len() * ADDRESS_SIZE) as u32
    }

    pub fn address_count(&self) -> usize {
        self.buffers.addresses.len()
    }

    /// Whether the caller's own token has fired.
    pub fn token_canceled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn into_buffers(self) -> Buffers {
        self.buffers
    }
}

/// Holds at most one [`OperationSlot`] and gives it up exactly once.
///
/// `install` is only called by the submitter before the native call, while
/// nothing else can observe the cell. `take` is safe from any thread: the
/// `armed` flag hands ownership to exactly one caller.
#[derive(Debug, Default)]
pub struct SlotCell {
    slot: UnsafeCell<Option<OperationSlot>>,
    armed: AtomicBool,
}

// SAFETY: access to `slot` is serialized by `armed`, see `install` and `take`.
unsafe impl Send for SlotCell {}
unsafe impl Sync for SlotCell {}

impl SlotCell {
    /// Installs a slot and returns a pointer to it for preparing the native call.
    ///
    /// # Safety
    ///
    /// The cell must be empty and no other thread may access it until this
    /// returns.
    pub unsafe fn install(&self, slot: OperationSlot) -> *mut OperationSlot {
        let cell = &mut *self.slot.get();
        let installed = cell.insert(slot) as *mut OperationSlot;
        self.armed.store(true, Ordering::Release);
        installed
    }

    /// Releases the slot. Only the first caller gets it.
    pub fn take(&self) -> Option<OperationSlot> {
        if self.armed.swap(false, Ordering::AcqRel) {
            // SAFETY: winning the swap grants exclusive access until the next install.
            unsafe { (*self.slot.get()).take() }
        } else {
            None
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
