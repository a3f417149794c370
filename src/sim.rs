//! In-memory NIC backend.
//!
//! Stands in for the kernel-bypass packet library in tests and demos:
//! per-queue receive slabs carved out at open, an injectable receive ring, a
//! bounded transmit ring, and enough counters to observe init/teardown and
//! slot recycling from the outside.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;
use eui48::MacAddress;
use parking_lot::Mutex;

use crate::nic::{NicDevice, NicError, NicPort, RX_BURST, RxDesc, RxSlot, SLOT_SIZE};
use crate::port::{MAX_NUM_QUEUES, PortConfig};

const SLOT_QUEUE_SHIFT: u32 = 24;
const SLOT_INDEX_MASK: u32 = (1 << SLOT_QUEUE_SHIFT) - 1;

fn join_slot(queue: usize, index: u32) -> RxSlot {
    RxSlot(((queue as u32) << SLOT_QUEUE_SHIFT) | index)
}

fn split_slot(slot: RxSlot) -> (usize, usize) {
    (
        (slot.0 >> SLOT_QUEUE_SHIFT) as usize,
        (slot.0 & SLOT_INDEX_MASK) as usize,
    )
}

struct Slab {
    bytes: Box<[UnsafeCell<[u8; SLOT_SIZE]>]>,
    free: ArrayQueue<u32>,
}

// SAFETY: the free list hands each slot index to exactly one holder at a
// time, so no two threads ever touch the same cell.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn new(nslots: usize) -> Slab {
        let mut bytes = Vec::with_capacity(nslots);
        for _ in 0..nslots {
            bytes.push(UnsafeCell::new([0u8; SLOT_SIZE]));
        }
        let free = ArrayQueue::new(nslots);
        for i in 0..nslots {
            free.push(i as u32).unwrap();
        }
        Slab {
            bytes: bytes.into_boxed_slice(),
            free,
        }
    }

    fn checked_out(&self) -> usize {
        self.free.capacity() - self.free.len()
    }
}

struct SimPort {
    mac: MacAddress,
    link_mbps: u32,
    slabs: Vec<Slab>,
    rx_rings: Vec<Mutex<VecDeque<RxDesc>>>,
    tx_ring: Mutex<VecDeque<Vec<u8>>>,
    tx_depth: usize,
    teardowns: Arc<AtomicUsize>,
}

impl NicPort for SimPort {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn link_speed_mbps(&self) -> u32 {
        self.link_mbps
    }

    fn rx_burst(&self, queue: u8, max: usize, out: &mut ArrayVec<RxDesc, RX_BURST>) -> usize {
        let Some(ring) = self.rx_rings.get(queue as usize) else {
            return 0;
        };
        let mut ring = ring.lock();
        let mut taken = 0;
        while taken < max && !out.is_full() {
            let Some(desc) = ring.pop_front() else { break };
            out.push(desc);
            taken += 1;
        }
        taken
    }

    fn tx_enqueue(&self, _queue: u8, frame: &[u8]) -> Result<(), NicError> {
        let mut ring = self.tx_ring.lock();
        if ring.len() >= self.tx_depth {
            return Err(NicError::TxRingFull);
        }
        ring.push_back(frame.to_vec());
        Ok(())
    }

    unsafe fn slot_bytes(&self, slot: RxSlot, len: usize) -> *mut [u8] {
        let (queue, index) = split_slot(slot);
        let ptr = self.slabs[queue].bytes[index].get().cast::<u8>();
        std::ptr::slice_from_raw_parts_mut(ptr, len)
    }

    fn release_slot(&self, slot: RxSlot) {
        let (queue, index) = split_slot(slot);
        // every slot is out at most once, the push cannot fail
        self.slabs[queue].free.push(index as u32).unwrap();
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-memory NIC. One value stands for one physical port's hardware; the
/// handle stays useful across open/teardown cycles.
pub struct SimNic {
    mac: MacAddress,
    link_mbps: u32,
    tx_depth_override: Option<usize>,
    fail_open: AtomicBool,
    inits: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    port: Mutex<Weak<SimPort>>,
}

impl SimNic {
    pub fn new(mac: MacAddress) -> Self {
        SimNic {
            mac,
            link_mbps: 10_000,
            tx_depth_override: None,
            fail_open: AtomicBool::new(false),
            inits: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
            port: Mutex::new(Weak::new()),
        }
    }

    pub fn with_link_speed(mut self, mbps: u32) -> Self {
        self.link_mbps = mbps;
        self
    }

    /// Caps the transmit ring below the configured ring depth, for tests that
    /// need to hit the full-ring path quickly.
    pub fn with_tx_depth(mut self, depth: usize) -> Self {
        self.tx_depth_override = Some(depth);
        self
    }

    /// Makes the next `open` fail with an init error.
    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Puts a frame on the wire towards `queue`'s receive ring. Returns false
    /// when the port is down, the frame oversized or the slab exhausted.
    pub fn inject(&self, queue: u8, frame: &[u8]) -> bool {
        if frame.len() > SLOT_SIZE {
            return false;
        }
        let Some(port) = self.port.lock().upgrade() else {
            return false;
        };
        let Some(slab) = port.slabs.get(queue as usize) else {
            return false;
        };
        let Some(index) = slab.free.pop() else {
            return false;
        };
        // SAFETY: the index just left the free list, nobody else holds it
        unsafe {
            let ptr = slab.bytes[index as usize].get().cast::<u8>();
            std::ptr::copy_nonoverlapping(frame.as_ptr(), ptr, frame.len());
        }
        port.rx_rings[queue as usize].lock().push_back(RxDesc {
            slot: join_slot(queue as usize, index),
            len: frame.len() as u16,
        });
        true
    }

    /// Takes everything off the transmit ring, freeing its capacity.
    pub fn drain_tx(&self) -> Vec<Vec<u8>> {
        match self.port.lock().upgrade() {
            Some(port) => port.tx_ring.lock().drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn pending_tx(&self) -> usize {
        match self.port.lock().upgrade() {
            Some(port) => port.tx_ring.lock().len(),
            None => 0,
        }
    }

    /// Receive slots currently away from their slabs (queued or held upstream).
    pub fn outstanding_slots(&self) -> usize {
        match self.port.lock().upgrade() {
            Some(port) => port.slabs.iter().map(Slab::checked_out).sum(),
            None => 0,
        }
    }
}

impl NicDevice for SimNic {
    fn open(&self, cfg: &PortConfig) -> Result<Arc<dyn NicPort>, NicError> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(NicError::Init("link did not come up".into()));
        }
        let depth = cfg.ring_depth as usize;
        let mut slabs = Vec::with_capacity(MAX_NUM_QUEUES);
        let mut rx_rings = Vec::with_capacity(MAX_NUM_QUEUES);
        for _ in 0..MAX_NUM_QUEUES {
            slabs.push(Slab::new(depth));
            rx_rings.push(Mutex::new(VecDeque::new()));
        }
        let port = Arc::new(SimPort {
            mac: self.mac,
            link_mbps: self.link_mbps,
            slabs,
            rx_rings,
            tx_ring: Mutex::new(VecDeque::new()),
            tx_depth: self.tx_depth_override.unwrap_or(depth),
            teardowns: self.teardowns.clone(),
        });
        self.inits.fetch_add(1, Ordering::SeqCst);
        *self.port.lock() = Arc::downgrade(&port);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::HwFrame;

    fn mac() -> MacAddress {
        MacAddress::new([0x98, 0x03, 0x9b, 0x01, 0x02, 0x03])
    }

    fn open(nic: &SimNic, ring_depth: u16) -> Arc<dyn NicPort> {
        let cfg = PortConfig {
            ring_depth,
            ..PortConfig::default()
        };
        nic.open(&cfg).unwrap()
    }

    #[test]
    fn test_inject_then_burst_round_trip() {
        let nic = SimNic::new(mac());
        let port = open(&nic, 4);
        assert_eq!(port.mac(), mac());
        assert!(nic.inject(0, b"hello"));

        let mut out = ArrayVec::new();
        assert_eq!(port.rx_burst(0, RX_BURST, &mut out), 1);
        let frame = HwFrame::new(port.clone(), out[0]);
        assert_eq!(frame.bytes(), b"hello");
        assert_eq!(nic.outstanding_slots(), 1);
        drop(frame);
        assert_eq!(nic.outstanding_slots(), 0);
    }

    #[test]
    fn test_inject_exhausts_slab_until_release() {
        let nic = SimNic::new(mac());
        let port = open(&nic, 1);
        assert!(nic.inject(0, b"a"));
        assert!(!nic.inject(0, b"b"));

        let mut out = ArrayVec::new();
        port.rx_burst(0, RX_BURST, &mut out);
        port.release_slot(out[0].slot);
        assert!(nic.inject(0, b"b"));
    }

    #[test]
    fn test_tx_ring_fills_and_drains() {
        let nic = SimNic::new(mac()).with_tx_depth(2);
        let port = open(&nic, 4);
        port.tx_enqueue(0, b"one").unwrap();
        port.tx_enqueue(0, b"two").unwrap();
        assert!(matches!(
            port.tx_enqueue(0, b"three"),
            Err(NicError::TxRingFull)
        ));
        let sent = nic.drain_tx();
        assert_eq!(sent, vec![b"one".to_vec(), b"two".to_vec()]);
        port.tx_enqueue(0, b"three").unwrap();
        assert_eq!(nic.pending_tx(), 1);
    }

    #[test]
    fn test_fail_next_open_fails_once() {
        let nic = SimNic::new(mac());
        nic.fail_next_open();
        assert!(nic.open(&PortConfig::default()).is_err());
        assert!(nic.open(&PortConfig::default()).is_ok());
        assert_eq!(nic.init_count(), 1);
    }

    #[test]
    fn test_teardown_counted_once_per_open() {
        let nic = SimNic::new(mac());
        let port = open(&nic, 2);
        assert_eq!(nic.init_count(), 1);
        assert_eq!(nic.teardown_count(), 0);
        drop(port);
        assert_eq!(nic.teardown_count(), 1);
        assert!(!nic.inject(0, b"late"));
    }

    #[test]
    fn test_bursts_respect_max() {
        let nic = SimNic::new(mac());
        let port = open(&nic, 8);
        for _ in 0..5 {
            assert!(nic.inject(0, b"x"));
        }
        let mut out = ArrayVec::new();
        assert_eq!(port.rx_burst(0, 2, &mut out), 2);
        assert_eq!(port.rx_burst(0, RX_BURST, &mut out), 3);
        for desc in &out {
            port.release_slot(desc.slot);
        }
    }
}
