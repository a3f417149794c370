use thiserror::Error;

use crate::nic::NicError;

/// Errors surfaced by driver operations.
///
/// The exhaustion variants ([`TxRingFull`](Error::TxRingFull),
/// [`RelayFull`](Error::RelayFull)) are transient backpressure: nothing was
/// lost and the caller owns the retry policy. Everything else is a caller bug
/// or a hardware init failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transmit ring full")]
    TxRingFull,
    #[error("relay channel to queue owner full")]
    RelayFull,
    #[error("packet too big: {len} bytes, limit {max}")]
    TooBigPacket { len: usize, max: usize },
    #[error("priority {requested} above configured maximum {max}")]
    BadPriority { requested: u8, max: u8 },
    #[error("no queues available")]
    NoQueuesAvailable,
    #[error("bad driver configuration: {0}")]
    Config(&'static str),
    #[error("bad address: {0}")]
    Addr(#[from] eui48::ParseError),
    #[error(transparent)]
    Nic(NicError),
}

impl Error {
    /// True for transient exhaustion the caller should treat as backpressure
    /// rather than failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::TxRingFull | Error::RelayFull)
    }
}

impl From<NicError> for Error {
    fn from(err: NicError) -> Self {
        // a full transmit ring keeps one spelling at the driver surface
        match err {
            NicError::TxRingFull => Error::TxRingFull,
            err => Error::Nic(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_classification() {
        assert!(Error::TxRingFull.is_backpressure());
        assert!(Error::RelayFull.is_backpressure());
        assert!(!Error::NoQueuesAvailable.is_backpressure());
        assert!(!Error::TooBigPacket { len: 2000, max: 1500 }.is_backpressure());
    }

    #[test]
    fn test_nic_tx_full_maps_to_backpressure() {
        let err: Error = NicError::TxRingFull.into();
        assert!(matches!(err, Error::TxRingFull));
        let err: Error = NicError::Init("bad port".into()).into();
        assert!(matches!(err, Error::Nic(NicError::Init(_))));
    }

    #[test]
    fn test_no_queues_message() {
        assert_eq!(Error::NoQueuesAvailable.to_string(), "no queues available");
    }
}
