//! The per-context driver façade: send, receive, and the facts the transport
//! needs about the wire.
//!
//! One [`Driver`] per worker context, all sharing a physical port through its
//! [`PortManager`]. The instance holding queue ownership talks to the
//! hardware and forwards for everyone else; the rest move frames over the
//! loopback channels. Nothing on these paths blocks, takes the lifecycle
//! lock, or retries: exhaustion comes back as an error or a short batch.

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use eui48::MacAddress;
use log::{debug, trace, warn};
use ringbuf::traits::{Consumer, Producer};

use crate::addr;
use crate::errors::{Error, Result};
use crate::frame::{self, ETHER_PACKET_OVERHEAD, ETHER_VLAN_HDR_LEN, FrameView, MAX_PAYLOAD_SIZE};
use crate::hint::{likely, unlikely};
use crate::loopback::{InstanceEndpoints, OwnerBundle};
use crate::nic::{HwFrame, NicPort, RX_BURST, RxDesc, SLOT_SIZE};
use crate::pool::{BufferPool, Outstanding, PacketBuf};
use crate::port::PortManager;
use crate::priority::PriorityRange;

/// The single hardware queue pair a port exposes to its owner.
const HW_QUEUE: u8 = 0;

/// Per-instance configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Numeric id of the owning worker context, for the registry and logs.
    pub client_id: u64,
    /// Lowest hardware priority level this instance may use.
    pub lowest_priority: u8,
    /// Highest hardware priority level this instance may use.
    pub highest_priority: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            client_id: 0,
            lowest_priority: 0,
            highest_priority: 7,
        }
    }
}

/// Data-path counters, snapshotted by [`Driver::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverStats {
    /// Frames this instance put on the hardware ring for itself.
    pub tx_direct: u64,
    /// Frames handed to the owner over the relay channel.
    pub tx_relayed: u64,
    /// Relayed frames this instance pumped onto the wire for others.
    pub relays_pumped: u64,
    /// Frames delivered zero-copy out of the hardware ring.
    pub rx_zero_copy: u64,
    /// Frames delivered out of the forward channel by copy.
    pub rx_copied: u64,
    /// Frames passed to another instance's forward channel.
    pub rx_forwarded: u64,
    /// Frames dropped because the target's forward channel was full.
    pub drop_forward_full: u64,
    /// Frames dropped for a queue slot nobody occupies.
    pub drop_unrouted: u64,
    /// Frames dropped as foreign or malformed.
    pub drop_foreign: u64,
    /// Times the copy-out pool came up empty mid-batch.
    pub pool_exhausted: u64,
}

/// One delivered packet: who sent it and its payload.
#[derive(Debug)]
pub struct Received {
    pub src: MacAddress,
    pub buf: PacketBuf,
}

/// A finite batch out of one `receive` poll. Yields at most the requested
/// number of packets and is never replenished behind the caller's back.
pub struct RxBatch {
    inner: arrayvec::IntoIter<Received, RX_BURST>,
}

impl RxBatch {
    fn new(batch: ArrayVec<Received, RX_BURST>) -> Self {
        RxBatch {
            inner: batch.into_iter(),
        }
    }
}

impl Iterator for RxBatch {
    type Item = Received;

    fn next(&mut self) -> Option<Received> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for RxBatch {}

/// One logical driver instance bound to a shared port.
pub struct Driver {
    pm: Arc<PortManager>,
    client_id: u64,
    queue: u8,
    mac: MacAddress,
    base_mac: MacAddress,
    bandwidth_mbps: u32,
    priorities: PriorityRange,
    nic: Arc<dyn NicPort>,
    pool: BufferPool,
    outstanding: Outstanding,
    endpoints: Option<InstanceEndpoints>,
    owner: Option<OwnerBundle>,
    stats: DriverStats,
}

impl Driver {
    /// Registers a new instance on `pm`, bringing the hardware up if this is
    /// the first one. Fails without side effects on a bad config, a full
    /// port, or a hardware init error.
    pub fn new(pm: Arc<PortManager>, cfg: DriverConfig) -> Result<Driver> {
        let priorities = PriorityRange::new(cfg.lowest_priority, cfg.highest_priority)?;
        let grant = pm.attach(cfg.client_id)?;
        let pool = BufferPool::new(pm.config().ring_depth as usize);
        Ok(Driver {
            client_id: cfg.client_id,
            queue: grant.queue,
            mac: grant.mac,
            base_mac: grant.base_mac,
            bandwidth_mbps: grant.bandwidth_mbps,
            priorities,
            nic: grant.nic,
            pool,
            outstanding: Outstanding::new(),
            endpoints: Some(grant.endpoints),
            owner: grant.bundle,
            stats: DriverStats::default(),
            pm,
        })
    }

    /// Builds one frame and queues it for transmit at `priority`.
    ///
    /// `header` goes first in the payload, then the `payload` chunks in
    /// order. Priority and size are checked before anything is queued; a full
    /// transmit ring or relay channel is backpressure, nothing is retried.
    pub fn send<'a>(
        &mut self,
        dst: MacAddress,
        header: &[u8],
        payload: impl IntoIterator<Item = &'a [u8]>,
        priority: u8,
    ) -> Result<()> {
        let pcp = self.priorities.pcp_for(priority)?;
        let wire = frame::build(dst, self.mac, pcp, header, payload)?;
        self.adopt_ownership();
        if self.owner.is_some() {
            self.nic.tx_enqueue(HW_QUEUE, &wire)?;
            self.stats.tx_direct += 1;
        } else {
            let relay = &mut self.endpoints_mut().relay_tx;
            if relay.try_push(wire.as_slice().into()).is_err() {
                return Err(Error::RelayFull);
            }
            self.stats.tx_relayed += 1;
        }
        Ok(())
    }

    /// Polls once for up to `max` packets, clamped to one hardware burst.
    ///
    /// The owner pumps relayed transmits first, delivers whatever a previous
    /// owner forwarded to it, then routes one receive burst; everyone else
    /// drains their forward channel, copying payloads into their own pool.
    /// Fewer packets than `max` just means a shorter batch; the channel and
    /// the wire are polled again on the next call.
    pub fn receive(&mut self, max: usize) -> RxBatch {
        self.adopt_ownership();
        let mut batch = ArrayVec::new();
        let max = max.min(RX_BURST);
        match self.owner.take() {
            Some(mut bundle) => {
                self.pump_relays(&mut bundle);
                if max > 0 {
                    // frames forwarded to us before we took ownership
                    self.drain_forwarded(max, &mut batch);
                    let rest = max - batch.len();
                    if rest > 0 {
                        self.poll_hardware(rest, &mut bundle, &mut batch);
                    }
                }
                self.owner = Some(bundle);
            }
            None => {
                if max > 0 {
                    self.drain_forwarded(max, &mut batch);
                }
            }
        }
        RxBatch::new(batch)
    }

    /// Largest payload `send` accepts (transport header plus data).
    pub fn max_packet_size(&self) -> usize {
        MAX_PAYLOAD_SIZE
    }

    /// Wire bytes each packet costs beyond its payload.
    pub fn packet_overhead(&self) -> usize {
        ETHER_VLAN_HDR_LEN + ETHER_PACKET_OVERHEAD
    }

    pub fn bandwidth_mbps(&self) -> u32 {
        self.bandwidth_mbps
    }

    /// Highest level `send` accepts; levels run `0..=highest_priority()`.
    pub fn highest_priority(&self) -> u8 {
        self.priorities.max_level()
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn queue_id(&self) -> u8 {
        self.queue
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn is_queue_owner(&self) -> bool {
        self.owner.is_some()
    }

    /// Packet buffers handed out by `receive` and not yet dropped.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.current()
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Self-description other nodes can feed to
    /// [`new_address`](crate::addr::new_address).
    pub fn service_locator(&self) -> String {
        format!("ethmux:port={},mac={}", self.pm.config().port_id, self.mac)
    }

    /// Picks up queue ownership if a departing owner left it to us.
    fn adopt_ownership(&mut self) {
        if self.owner.is_some() || self.pm.designated_owner() != self.queue as usize {
            return;
        }
        if let Some(bundle) = self.pm.take_handoff() {
            debug!(
                "client {}: queue {} took over the hardware queues",
                self.client_id, self.queue
            );
            self.owner = Some(bundle);
        }
    }

    /// Moves relayed frames onto the wire, peek first so a full transmit
    /// ring leaves the rest queued for the next poll.
    fn pump_relays(&mut self, bundle: &mut OwnerBundle) {
        for relay in bundle.relay_rx.iter_mut() {
            loop {
                let Some(wire) = relay.try_peek() else { break };
                if self.nic.tx_enqueue(HW_QUEUE, wire).is_err() {
                    return;
                }
                let _ = relay.try_pop();
                self.stats.relays_pumped += 1;
            }
        }
    }

    fn poll_hardware(
        &mut self,
        max: usize,
        bundle: &mut OwnerBundle,
        batch: &mut ArrayVec<Received, RX_BURST>,
    ) {
        let mut descs: ArrayVec<RxDesc, RX_BURST> = ArrayVec::new();
        self.nic.rx_burst(HW_QUEUE, max, &mut descs);
        for desc in descs {
            let hw = HwFrame::new(self.nic.clone(), desc);
            self.route_frame(hw, bundle, batch);
        }
    }

    /// Decides where one received frame goes: to this instance (zero-copy),
    /// to a sibling's forward channel, or back to the pool.
    fn route_frame(
        &mut self,
        hw: HwFrame,
        bundle: &mut OwnerBundle,
        batch: &mut ArrayVec<Received, RX_BURST>,
    ) {
        let (src, dst, header_len, ether_type) = match FrameView::parse(hw.bytes()) {
            Some(view) => (view.src, view.dst, view.header_len, view.ether_type),
            None => {
                self.stats.drop_foreign += 1;
                return;
            }
        };
        if unlikely(ether_type != frame::ETHER_TYPE) {
            trace!(
                "client {}: dropping foreign frame (ethertype {:#06x})",
                self.client_id, ether_type
            );
            self.stats.drop_foreign += 1;
            return;
        }
        if likely(dst == self.mac || dst.is_broadcast()) {
            batch.push(Received {
                src,
                buf: PacketBuf::zero_copy(hw, header_len, self.outstanding.checkout()),
            });
            self.stats.rx_zero_copy += 1;
            return;
        }
        match addr::queue_for_mac(self.base_mac, dst) {
            Some(queue) if self.pm.queue_registered(queue) => {
                if bundle.forward_tx[queue as usize].try_push(hw).is_err() {
                    // receiver not draining; the hardware ring must keep
                    // recycling, so the frame goes back instead of waiting
                    self.stats.drop_forward_full += 1;
                    warn!(
                        "client {}: forward channel to queue {} full, dropping frame",
                        self.client_id, queue
                    );
                } else {
                    self.stats.rx_forwarded += 1;
                }
            }
            Some(queue) => {
                trace!(
                    "client {}: frame for empty queue slot {}",
                    self.client_id, queue
                );
                self.stats.drop_unrouted += 1;
            }
            None => {
                trace!("client {}: frame for unknown station {}", self.client_id, dst);
                self.stats.drop_foreign += 1;
            }
        }
    }

    /// Copies forwarded frames into buffers from our own pool; the dropped
    /// hardware frame returns each DMA slot.
    fn drain_forwarded(&mut self, max: usize, batch: &mut ArrayVec<Received, RX_BURST>) {
        while batch.len() < max {
            if self.endpoints_mut().forward_rx.try_peek().is_none() {
                return;
            }
            // claim the copy target before popping so a dry pool leaves the
            // record queued
            let Some(mut slot) = self.pool.alloc() else {
                self.stats.pool_exhausted += 1;
                warn!(
                    "client {}: packet buffer pool dry ({} outstanding), leaving frames queued",
                    self.client_id,
                    self.outstanding.current()
                );
                return;
            };
            let Some(hw) = self.endpoints_mut().forward_rx.try_pop() else {
                return;
            };
            let Some(view) = FrameView::parse(hw.bytes()) else {
                self.stats.drop_foreign += 1;
                continue;
            };
            if unlikely(view.payload.len() > SLOT_SIZE) {
                self.stats.drop_foreign += 1;
                continue;
            }
            slot.fill(view.payload);
            batch.push(Received {
                src: view.src,
                buf: PacketBuf::copied(slot, self.outstanding.checkout()),
            });
            self.stats.rx_copied += 1;
        }
    }

    fn endpoints_mut(&mut self) -> &mut InstanceEndpoints {
        // endpoints live as long as the instance, the Option only exists for
        // the hand-back at detach
        self.endpoints.as_mut().unwrap()
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("client_id", &self.client_id)
            .field("queue", &self.queue)
            .field("mac", &self.mac)
            .field("owner", &self.owner.is_some())
            .finish()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(endpoints) = self.endpoints.as_mut() {
            let mut stale = 0usize;
            while let Some(hw) = endpoints.forward_rx.try_pop() {
                drop(hw);
                stale += 1;
            }
            if stale > 0 {
                debug!(
                    "client {}: released {} undelivered frames at detach",
                    self.client_id, stale
                );
            }
        }
        let leaked = self.outstanding.current();
        if leaked != 0 {
            warn!(
                "client {}: {} packet buffers still outstanding at detach",
                self.client_id, leaked
            );
        }
        if let Some(endpoints) = self.endpoints.take() {
            self.pm
                .detach(self.queue, self.client_id, endpoints, self.owner.take());
        }
    }
}
