//! Packet buffers and the pools behind them.
//!
//! A received frame reaches the transport as a [`PacketBuf`]: either a
//! zero-copy view over the DMA slot it arrived in, or a copy into a slot from
//! the receiving instance's own pool when the frame was relayed between
//! instances. Dropping the buffer is the release: the slot goes back to its
//! pool and the outstanding count comes back down, exactly once, because a
//! buffer cannot be duplicated.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam::queue::ArrayQueue;
use triomphe::Arc;

use crate::nic::{HwFrame, SLOT_SIZE};

/// Packet buffers an instance has handed out and not yet seen dropped.
#[derive(Debug, Clone)]
pub(crate) struct Outstanding {
    count: Arc<AtomicI64>,
}

impl Outstanding {
    pub(crate) fn new() -> Self {
        Outstanding {
            count: Arc::new(AtomicI64::new(0)),
        }
    }

    pub(crate) fn current(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn checkout(&self) -> OutstandingGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        OutstandingGuard {
            count: self.count.clone(),
        }
    }
}

/// Decrements the outstanding count when the buffer holding it drops.
#[derive(Debug)]
pub(crate) struct OutstandingGuard {
    count: Arc<AtomicI64>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Slots {
    bytes: Box<[UnsafeCell<[u8; SLOT_SIZE]>]>,
    free: ArrayQueue<u16>,
}

// SAFETY: the free list hands each index to exactly one holder at a time, so
// no two threads ever touch the same cell.
unsafe impl Send for Slots {}
unsafe impl Sync for Slots {}

/// Fixed-capacity pool of frame-sized slots backing copy-out buffers.
#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Slots>,
}

impl BufferPool {
    pub(crate) fn new(nslots: usize) -> Self {
        debug_assert!(nslots > 0 && nslots <= u16::MAX as usize);
        let mut bytes = Vec::with_capacity(nslots);
        for _ in 0..nslots {
            bytes.push(UnsafeCell::new([0u8; SLOT_SIZE]));
        }
        let free = ArrayQueue::new(nslots);
        for i in 0..nslots {
            free.push(i as u16).unwrap();
        }
        BufferPool {
            inner: Arc::new(Slots {
                bytes: bytes.into_boxed_slice(),
                free,
            }),
        }
    }

    /// Pops a free slot, or `None` when every slot is checked out.
    pub(crate) fn alloc(&self) -> Option<PooledBuf> {
        let index = self.inner.free.pop()?;
        Some(PooledBuf {
            pool: self.inner.clone(),
            index,
            len: 0,
        })
    }
}

/// One checked-out pool slot plus the initialized length.
pub(crate) struct PooledBuf {
    pool: Arc<Slots>,
    index: u16,
    len: u16,
}

impl PooledBuf {
    /// Copies `src` into the slot; the caller keeps `src` within [`SLOT_SIZE`].
    pub(crate) fn fill(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= SLOT_SIZE);
        // SAFETY: the free list guarantees this index is ours alone
        let slot = unsafe { &mut *self.pool.bytes[self.index as usize].get() };
        slot[..src.len()].copy_from_slice(src);
        self.len = src.len() as u16;
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: same exclusive ownership as in fill
        let slot = unsafe { &*self.pool.bytes[self.index as usize].get() };
        &slot[..self.len as usize]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // capacity equals the slot count, the push cannot fail
        self.pool.free.push(self.index).unwrap();
    }
}

enum Backing {
    Hw(HwFrame),
    Pooled(PooledBuf),
}

/// A received packet as handed to the transport. Derefs to the payload bytes.
pub struct PacketBuf {
    backing: Backing,
    payload_start: u16,
    _guard: OutstandingGuard,
}

impl PacketBuf {
    pub(crate) fn zero_copy(hw: HwFrame, payload_start: usize, guard: OutstandingGuard) -> Self {
        debug_assert!(payload_start <= hw.len());
        PacketBuf {
            backing: Backing::Hw(hw),
            payload_start: payload_start as u16,
            _guard: guard,
        }
    }

    pub(crate) fn copied(buf: PooledBuf, guard: OutstandingGuard) -> Self {
        PacketBuf {
            backing: Backing::Pooled(buf),
            payload_start: 0,
            _guard: guard,
        }
    }

    /// True when the payload aliases NIC memory instead of a private copy.
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.backing, Backing::Hw(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Hw(hw) => &hw.bytes()[self.payload_start as usize..],
            Backing::Pooled(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len())
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}
