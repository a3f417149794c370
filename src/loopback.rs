//! Bounded SPSC channels hauling frames between the queue owner and the other
//! instances sharing a port.
//!
//! Two directions, two channels per queue slot, all created when the port
//! comes up. Forward (owner to instance) carries received [`HwFrame`]s, so a
//! record dropped anywhere along the way releases its DMA slot; relay
//! (instance to owner) carries frames already built for transmit. A full ring
//! is backpressure, never blocking.

use std::sync::Arc;

use ringbuf::storage::Heap;
use ringbuf::traits::Split;
use ringbuf::{CachingCons, CachingProd, HeapRb, SharedRb};

use crate::nic::HwFrame;

pub(crate) type Prod<T> = CachingProd<Arc<SharedRb<Heap<T>>>>;
pub(crate) type Cons<T> = CachingCons<Arc<SharedRb<Heap<T>>>>;

pub(crate) fn channel<T>(capacity: usize) -> (Prod<T>, Cons<T>) {
    HeapRb::new(capacity).split()
}

/// The halves an attached instance drives. Handed out at attach, returned at
/// detach so the next occupant of the slot keeps the same rings.
pub(crate) struct InstanceEndpoints {
    pub(crate) forward_rx: Cons<HwFrame>,
    pub(crate) relay_tx: Prod<Box<[u8]>>,
}

/// The owner-side halves for every queue slot. Travels with queue ownership.
pub(crate) struct OwnerBundle {
    pub(crate) forward_tx: Vec<Prod<HwFrame>>,
    pub(crate) relay_rx: Vec<Cons<Box<[u8]>>>,
}

pub(crate) fn port_channels(
    nqueues: usize,
    depth: usize,
) -> (OwnerBundle, Vec<InstanceEndpoints>) {
    let mut bundle = OwnerBundle {
        forward_tx: Vec::with_capacity(nqueues),
        relay_rx: Vec::with_capacity(nqueues),
    };
    let mut endpoints = Vec::with_capacity(nqueues);
    for _ in 0..nqueues {
        let (forward_tx, forward_rx) = channel(depth);
        let (relay_tx, relay_rx) = channel(depth);
        bundle.forward_tx.push(forward_tx);
        bundle.relay_rx.push(relay_rx);
        endpoints.push(InstanceEndpoints {
            forward_rx,
            relay_tx,
        });
    }
    (bundle, endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::{Consumer, Observer, Producer};

    #[test]
    fn test_channel_bounded_fifo() {
        let (mut tx, mut rx) = channel::<u32>(2);
        assert!(tx.try_push(1).is_ok());
        assert!(tx.try_push(2).is_ok());
        assert!(tx.try_push(3).is_err());
        assert_eq!(rx.try_pop(), Some(1));
        assert!(tx.try_push(3).is_ok());
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), Some(3));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_port_channels_shape() {
        let (bundle, endpoints) = port_channels(4, 8);
        assert_eq!(bundle.forward_tx.len(), 4);
        assert_eq!(bundle.relay_rx.len(), 4);
        assert_eq!(endpoints.len(), 4);
        for ep in &endpoints {
            assert_eq!(ep.forward_rx.vacant_len(), 8);
            assert!(ep.forward_rx.is_empty());
        }
    }
}
