//! The seam between the driver core and the kernel-bypass packet library.
//!
//! The packet library itself (DMA mapping, descriptor rings, link bring-up) is
//! a black box; this module pins down the narrow interface the core needs from
//! it: open a port with per-queue buffer pools already allocated, poll a
//! receive queue, enqueue a frame for transmit, and hand borrowed slots back.
//! [`SimNic`](crate::sim::SimNic) is the in-memory implementation used by
//! tests and demos.

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use eui48::MacAddress;
use thiserror::Error;

use crate::port::PortConfig;

/// Largest number of frames moved per poll of a hardware queue.
pub const RX_BURST: usize = 32;

/// Bytes of DMA memory backing one receive slot.
pub const SLOT_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum NicError {
    #[error("transmit ring full")]
    TxRingFull,
    #[error("port init failed: {0}")]
    Init(String),
}

/// Opaque handle to one receive slot inside a port's DMA area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxSlot(pub u32);

/// One received frame as reported by the hardware.
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    pub slot: RxSlot,
    pub len: u16,
}

/// Factory side of the packet library: brings a port up.
pub trait NicDevice: Send + Sync {
    /// Initializes the link and allocates the receive pools for every queue
    /// slot up front. Called exactly once per activation of a port.
    fn open(&self, cfg: &PortConfig) -> Result<Arc<dyn NicPort>, NicError>;
}

/// An initialized port. All methods are poll-style and never block.
pub trait NicPort: Send + Sync {
    /// Station address burned into the port.
    fn mac(&self) -> MacAddress;

    /// Negotiated link speed in Mbit/s.
    fn link_speed_mbps(&self) -> u32;

    /// Polls one receive queue, appending at most `max` descriptors to `out`.
    /// Returns the number appended.
    fn rx_burst(&self, queue: u8, max: usize, out: &mut ArrayVec<RxDesc, RX_BURST>) -> usize;

    /// Hands one frame to the transmit ring of `queue`. A full ring is
    /// reported as [`NicError::TxRingFull`] and the frame is not taken.
    fn tx_enqueue(&self, queue: u8, frame: &[u8]) -> Result<(), NicError>;

    /// Raw bytes of a slot handed out by [`rx_burst`](NicPort::rx_burst).
    ///
    /// # Safety
    ///
    /// `slot` must have been produced by this port and not yet released, and
    /// the caller must be its sole user for the lifetime of the pointer.
    unsafe fn slot_bytes(&self, slot: RxSlot, len: usize) -> *mut [u8];

    /// Returns a slot to its pool for rearming.
    fn release_slot(&self, slot: RxSlot);
}

/// RAII handle over one received hardware frame.
///
/// Keeps the port alive and returns the slot to its pool on drop, so a frame
/// forwarded between instances or parked in a packet buffer cannot outlive
/// the DMA memory behind it.
pub struct HwFrame {
    port: Arc<dyn NicPort>,
    slot: RxSlot,
    len: u16,
}

impl HwFrame {
    pub(crate) fn new(port: Arc<dyn NicPort>, desc: RxDesc) -> Self {
        HwFrame {
            port,
            slot: desc.slot,
            len: desc.len,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the slot came from this port's receive ring and stays
        // checked out until drop; the borrow cannot outlive the handle.
        unsafe { &*self.port.slot_bytes(self.slot, self.len as usize) }
    }
}

impl fmt::Debug for HwFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwFrame")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for HwFrame {
    fn drop(&mut self) {
        self.port.release_slot(self.slot);
    }
}
