//! Ethmux: a kernel-bypass Ethernet driver multiplexer.
//!
//! Several logical driver instances share one physical port. The instance
//! holding queue ownership polls the hardware and forwards frames for its
//! siblings over bounded loopback channels; everyone else sees the same
//! send/receive contract without touching the NIC.

pub mod addr;
pub mod driver;
pub mod errors;
pub mod frame;
mod hint;
mod loopback;
pub mod nic;
pub mod pool;
pub mod port;
pub mod priority;
pub mod sim;

// Re-exports for the common path: one driver per worker, one manager per port.
pub use addr::new_address;
pub use driver::{Driver, DriverConfig, DriverStats, Received, RxBatch};
pub use errors::{Error, Result};
pub use eui48::MacAddress;
pub use pool::PacketBuf;
pub use port::{MAX_NUM_QUEUES, PortConfig, PortManager};
pub use sim::SimNic;
