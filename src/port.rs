//! Shared-port registry and lifecycle.
//!
//! Every driver instance on one physical port goes through a single
//! [`PortManager`]. Construction and destruction serialize on one lifecycle
//! lock; the little state the data path reads afterwards (who owns the
//! hardware queues, which slots are inhabited) lives in atomics next to that
//! lock, so send and receive never take it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use eui48::MacAddress;
use log::{debug, info};
use parking_lot::Mutex;

use crate::addr;
use crate::errors::{Error, Result};
use crate::loopback::{self, InstanceEndpoints, OwnerBundle};
use crate::nic::{NicDevice, NicPort};

/// Queue slots one port can hand out.
pub const MAX_NUM_QUEUES: usize = 8;

/// Default hardware descriptor ring depth; also sizes the buffer pools and
/// the loopback rings.
pub const DEFAULT_RING_DEPTH: u16 = 256;

const NO_OWNER: usize = usize::MAX;

/// Static configuration of one physical port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port index as the packet library counts them.
    pub port_id: u16,
    /// Overrides the burned-in station address as the base for per-queue MACs.
    pub mac_override: Option<MacAddress>,
    /// Receive descriptor ring depth per queue.
    pub ring_depth: u16,
    /// Loopback ring depth; defaults to `ring_depth`, which is enough to park
    /// every slot of the receive pool.
    pub loopback_depth: Option<u16>,
    /// Reported bandwidth; defaults to the negotiated link speed.
    pub bandwidth_mbps: Option<u32>,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            port_id: 0,
            mac_override: None,
            ring_depth: DEFAULT_RING_DEPTH,
            loopback_depth: None,
            bandwidth_mbps: None,
        }
    }
}

impl PortConfig {
    fn validate(&self) -> Result<()> {
        if self.ring_depth == 0 {
            return Err(Error::Config("ring_depth must be nonzero"));
        }
        if self.loopback_depth == Some(0) {
            return Err(Error::Config("loopback_depth must be nonzero"));
        }
        Ok(())
    }
}

struct QueueSlot {
    client_id: u64,
}

struct ActivePort {
    nic: Arc<dyn NicPort>,
    base_mac: MacAddress,
    bandwidth_mbps: u32,
    queues: [Option<QueueSlot>; MAX_NUM_QUEUES],
    endpoints: [Option<InstanceEndpoints>; MAX_NUM_QUEUES],
}

enum PortState {
    Uninitialized,
    Active(Box<ActivePort>),
    Shutdown,
}

impl PortState {
    fn is_active(&self) -> bool {
        matches!(self, PortState::Active(_))
    }
}

/// Everything an instance walks away from `attach` with.
pub(crate) struct AttachGrant {
    pub(crate) queue: u8,
    pub(crate) mac: MacAddress,
    pub(crate) base_mac: MacAddress,
    pub(crate) bandwidth_mbps: u32,
    pub(crate) nic: Arc<dyn NicPort>,
    pub(crate) endpoints: InstanceEndpoints,
    /// Present only for the instance that brought the port up.
    pub(crate) bundle: Option<OwnerBundle>,
}

impl fmt::Debug for AttachGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachGrant")
            .field("queue", &self.queue)
            .field("mac", &self.mac)
            .field("owner", &self.bundle.is_some())
            .finish()
    }
}

/// Registry and lifecycle manager for one physical port.
pub struct PortManager {
    cfg: PortConfig,
    device: Arc<dyn NicDevice>,
    state: Mutex<PortState>,
    owner_queue: AtomicUsize,
    queue_mask: AtomicU8,
    handoff: Mutex<Option<OwnerBundle>>,
}

impl PortManager {
    pub fn new(device: Arc<dyn NicDevice>, cfg: PortConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(PortManager {
            cfg,
            device,
            state: Mutex::new(PortState::Uninitialized),
            owner_queue: AtomicUsize::new(NO_OWNER),
            queue_mask: AtomicU8::new(0),
            handoff: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PortConfig {
        &self.cfg
    }

    /// Queue slots currently inhabited.
    pub fn active_queues(&self) -> u32 {
        self.queue_mask.load(Ordering::Relaxed).count_ones()
    }

    /// Registers a new instance: first one in an epoch brings the hardware up
    /// and becomes the queue owner; everyone gets the lowest free slot.
    pub(crate) fn attach(&self, client_id: u64) -> Result<AttachGrant> {
        let mut state = self.state.lock();
        let mut first_bundle = None;
        if !state.is_active() {
            let (active, bundle) = self.init_port()?;
            *state = PortState::Active(Box::new(active));
            first_bundle = Some(bundle);
            info!("port {}: hardware initialized", self.cfg.port_id);
        }
        let PortState::Active(port) = &mut *state else {
            unreachable!("state is active past init")
        };

        let Some(queue) = port.queues.iter().position(Option::is_none) else {
            return Err(Error::NoQueuesAvailable);
        };
        // endpoints are parked in the slot whenever it is empty
        let endpoints = port.endpoints[queue].take().unwrap();
        port.queues[queue] = Some(QueueSlot { client_id });
        self.queue_mask.fetch_or(1 << queue, Ordering::Release);
        if first_bundle.is_some() {
            self.owner_queue.store(queue, Ordering::Release);
        }
        let mac = addr::queue_mac(port.base_mac, queue as u8);
        debug!(
            "port {}: queue {} attached for client {} as {}",
            self.cfg.port_id, queue, client_id, mac
        );
        Ok(AttachGrant {
            queue: queue as u8,
            mac,
            base_mac: port.base_mac,
            bandwidth_mbps: port.bandwidth_mbps,
            nic: port.nic.clone(),
            endpoints,
            bundle: first_bundle,
        })
    }

    /// Unregisters an instance, handing queue ownership to the survivor with
    /// the lowest queue id or shutting the hardware down after the last one.
    pub(crate) fn detach(
        &self,
        queue: u8,
        client_id: u64,
        endpoints: InstanceEndpoints,
        bundle: Option<OwnerBundle>,
    ) {
        let queue = queue as usize;
        let mut state = self.state.lock();
        let PortState::Active(port) = &mut *state else {
            debug_assert!(false, "detach on inactive port");
            return;
        };
        debug_assert!(
            port.queues[queue]
                .as_ref()
                .is_some_and(|slot| slot.client_id == client_id),
            "queue {queue} is not held by client {client_id}"
        );
        port.queues[queue] = None;
        port.endpoints[queue] = Some(endpoints);
        self.queue_mask.fetch_and(!(1u8 << queue), Ordering::Release);
        debug!(
            "port {}: queue {} detached (client {})",
            self.cfg.port_id, queue, client_id
        );

        // a designated owner that never polled leaves its bundle parked in
        // the hand-off slot; reclaim it so ownership keeps moving
        let bundle = bundle.or_else(|| {
            if self.owner_queue.load(Ordering::Acquire) == queue {
                self.handoff.lock().take()
            } else {
                None
            }
        });
        let Some(bundle) = bundle else {
            return;
        };
        match port.queues.iter().position(Option::is_some) {
            Some(next) => {
                // deposit the bundle before publishing the new designation
                *self.handoff.lock() = Some(bundle);
                self.owner_queue.store(next, Ordering::Release);
                debug!(
                    "port {}: queue ownership moved to queue {}",
                    self.cfg.port_id, next
                );
            }
            None => {
                self.owner_queue.store(NO_OWNER, Ordering::Release);
                drop(bundle);
                *state = PortState::Shutdown;
                info!(
                    "port {}: last instance gone, hardware released",
                    self.cfg.port_id
                );
            }
        }
    }

    fn init_port(&self) -> Result<(ActivePort, OwnerBundle)> {
        let nic = self.device.open(&self.cfg)?;
        let base_mac = self.cfg.mac_override.unwrap_or_else(|| nic.mac());
        let bandwidth_mbps = self
            .cfg
            .bandwidth_mbps
            .unwrap_or_else(|| nic.link_speed_mbps());
        let loopback_depth = self.cfg.loopback_depth.unwrap_or(self.cfg.ring_depth);
        let (bundle, eps) = loopback::port_channels(MAX_NUM_QUEUES, loopback_depth as usize);
        let mut endpoints: [Option<InstanceEndpoints>; MAX_NUM_QUEUES] =
            std::array::from_fn(|_| None);
        for (slot, ep) in endpoints.iter_mut().zip(eps) {
            *slot = Some(ep);
        }
        Ok((
            ActivePort {
                nic,
                base_mac,
                bandwidth_mbps,
                queues: std::array::from_fn(|_| None),
                endpoints,
            },
            bundle,
        ))
    }

    /// Queue currently designated to own the hardware queues, if any.
    pub(crate) fn designated_owner(&self) -> usize {
        self.owner_queue.load(Ordering::Acquire)
    }

    /// Claims an ownership bundle parked by a departing owner.
    pub(crate) fn take_handoff(&self) -> Option<OwnerBundle> {
        self.handoff.lock().take()
    }

    /// Lock-free check the owner's routing uses on the data path.
    pub(crate) fn queue_registered(&self, queue: u8) -> bool {
        self.queue_mask.load(Ordering::Relaxed) & (1 << queue) != 0
    }
}
