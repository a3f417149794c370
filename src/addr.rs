//! MAC address handling: locator parsing and per-queue station addresses.
//!
//! Every driver instance on a shared port answers to its own MAC so the queue
//! owner can route received frames without touching anything above Ethernet.
//! An instance address is the port's base address with the locally-administered
//! bit set, the multicast bit cleared, and the queue id in bits 2..=4 of the
//! first byte; bytes 1..=5 of the burned-in address stay intact. Three bits of
//! queue id is exactly [`MAX_NUM_QUEUES`](crate::port::MAX_NUM_QUEUES) values.

use eui48::MacAddress;

use crate::errors::Result;

const MULTICAST_BIT: u8 = 0x01;
const LOCAL_ADMIN_BIT: u8 = 0x02;
const QUEUE_SHIFT: u8 = 2;
const QUEUE_FIELD: u8 = 0b0001_1100;

/// Parses a peer address out of a locator fragment.
///
/// Accepts a bare MAC in any common notation as well as the `mac=<addr>`
/// option form used in service locator strings.
pub fn new_address(locator: &str) -> Result<MacAddress> {
    let text = locator.trim();
    let text = text.strip_prefix("mac=").unwrap_or(text);
    Ok(MacAddress::parse_str(text)?)
}

/// Station address for `queue` on a port whose burned-in address is `base`.
pub(crate) fn queue_mac(base: MacAddress, queue: u8) -> MacAddress {
    debug_assert!((queue as usize) < crate::port::MAX_NUM_QUEUES);
    let mut bytes = base.to_array();
    bytes[0] = (bytes[0] & !(QUEUE_FIELD | MULTICAST_BIT | LOCAL_ADMIN_BIT))
        | LOCAL_ADMIN_BIT
        | (queue << QUEUE_SHIFT);
    MacAddress::new(bytes)
}

/// Recovers the queue id from a station address derived off `base`, or `None`
/// if the address does not belong to this port.
pub(crate) fn queue_for_mac(base: MacAddress, candidate: MacAddress) -> Option<u8> {
    let tagged = queue_mac(base, 0).to_array();
    let cand = candidate.to_array();
    if cand[1..] != tagged[1..] || (cand[0] & !QUEUE_FIELD) != tagged[0] {
        return None;
    }
    Some((cand[0] & QUEUE_FIELD) >> QUEUE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MAX_NUM_QUEUES;

    fn base() -> MacAddress {
        MacAddress::new([0x98, 0x03, 0x9b, 0x3f, 0x10, 0xc4])
    }

    #[test]
    fn test_queue_mac_round_trip() {
        for q in 0..MAX_NUM_QUEUES as u8 {
            let mac = queue_mac(base(), q);
            assert_eq!(queue_for_mac(base(), mac), Some(q));
            assert!(!mac.is_multicast());
        }
    }

    #[test]
    fn test_queue_mac_keeps_tail_bytes() {
        let mac = queue_mac(base(), 5).to_array();
        assert_eq!(&mac[1..], &base().to_array()[1..]);
        assert_eq!(mac[0] & LOCAL_ADMIN_BIT, LOCAL_ADMIN_BIT);
    }

    #[test]
    fn test_foreign_macs_do_not_map() {
        assert_eq!(queue_for_mac(base(), base()), None);
        assert_eq!(queue_for_mac(base(), MacAddress::broadcast()), None);
        let other = MacAddress::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(queue_for_mac(base(), other), None);
    }

    #[test]
    fn test_new_address_forms() {
        let plain = new_address("98:03:9b:3f:10:c4").unwrap();
        let option = new_address("mac=98:03:9b:3f:10:c4").unwrap();
        assert_eq!(plain, option);
        assert_eq!(plain, base());
        assert!(new_address("mac=not-a-mac").is_err());
    }
}
