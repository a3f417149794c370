//! Raw Ethernet framing: 802.1Q-tagged frames carrying driver payloads.

use arrayvec::ArrayVec;
use eui48::MacAddress;

use crate::errors::{Error, Result};

/// EtherType of driver frames (local experimental range).
pub const ETHER_TYPE: u16 = 0x88B5;
/// 802.1Q tag protocol identifier.
pub const TPID_8021Q: u16 = 0x8100;
/// Largest payload (transport header plus data) one frame carries.
pub const MAX_PAYLOAD_SIZE: usize = 1500;
/// Bytes added by the 802.1Q tag.
pub const VLAN_TAG_LEN: usize = 4;
/// Untagged Ethernet header: dst, src, EtherType.
pub const ETHER_HDR_LEN: usize = 14;
/// Ethernet header with the tag.
pub const ETHER_VLAN_HDR_LEN: usize = ETHER_HDR_LEN + VLAN_TAG_LEN;
/// Wire bytes per frame outside header and payload: preamble (7), start
/// delimiter (1), frame check sequence (4), interpacket gap (12).
pub const ETHER_PACKET_OVERHEAD: usize = 24;
/// Largest frame handed to the hardware.
pub const MAX_FRAME_LEN: usize = ETHER_VLAN_HDR_LEN + MAX_PAYLOAD_SIZE;

const TCI_PCP_SHIFT: u16 = 13;

/// A frame assembled for transmit, inline on the stack.
pub type FrameBuf = ArrayVec<u8, MAX_FRAME_LEN>;

/// Assembles a tagged frame: addresses, 802.1Q tag carrying `pcp` (VID 0),
/// EtherType, then `header` and the payload chunks in order.
///
/// A frame that would exceed [`MAX_PAYLOAD_SIZE`] is rejected with the full
/// attempted length before any hardware is involved.
pub fn build<'a>(
    dst: MacAddress,
    src: MacAddress,
    pcp: u8,
    header: &[u8],
    payload: impl IntoIterator<Item = &'a [u8]>,
) -> Result<FrameBuf> {
    debug_assert!(pcp <= 7);
    let mut hdr = [0u8; ETHER_VLAN_HDR_LEN];
    hdr[0..6].copy_from_slice(dst.as_bytes());
    hdr[6..12].copy_from_slice(src.as_bytes());
    hdr[12..14].copy_from_slice(&TPID_8021Q.to_be_bytes());
    hdr[14..16].copy_from_slice(&((pcp as u16) << TCI_PCP_SHIFT).to_be_bytes());
    hdr[16..18].copy_from_slice(&ETHER_TYPE.to_be_bytes());

    let mut frame = FrameBuf::new();
    // the 18 header bytes always fit in an empty frame
    frame.try_extend_from_slice(&hdr).unwrap();

    let mut chunks = payload.into_iter();
    if frame.try_extend_from_slice(header).is_err() {
        let rest: usize = chunks.map(|c| c.len()).sum();
        return Err(too_big(header.len() + rest));
    }
    while let Some(chunk) = chunks.next() {
        if frame.try_extend_from_slice(chunk).is_err() {
            let sent = frame.len() - ETHER_VLAN_HDR_LEN;
            let rest: usize = chunks.map(|c| c.len()).sum();
            return Err(too_big(sent + chunk.len() + rest));
        }
    }
    Ok(frame)
}

fn too_big(len: usize) -> Error {
    Error::TooBigPacket {
        len,
        max: MAX_PAYLOAD_SIZE,
    }
}

/// Borrowed view over a received frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub pcp: u8,
    pub ether_type: u16,
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Splits a frame into header fields and payload. Understands tagged and
    /// untagged frames; runts come back as `None`.
    pub fn parse(frame: &'a [u8]) -> Option<FrameView<'a>> {
        if frame.len() < ETHER_HDR_LEN {
            return None;
        }
        let dst = mac_at(frame, 0);
        let src = mac_at(frame, 6);
        let tpid = u16::from_be_bytes([frame[12], frame[13]]);
        if tpid == TPID_8021Q {
            if frame.len() < ETHER_VLAN_HDR_LEN {
                return None;
            }
            let tci = u16::from_be_bytes([frame[14], frame[15]]);
            Some(FrameView {
                dst,
                src,
                pcp: (tci >> TCI_PCP_SHIFT) as u8,
                ether_type: u16::from_be_bytes([frame[16], frame[17]]),
                header_len: ETHER_VLAN_HDR_LEN,
                payload: &frame[ETHER_VLAN_HDR_LEN..],
            })
        } else {
            Some(FrameView {
                dst,
                src,
                pcp: 0,
                ether_type: tpid,
                header_len: ETHER_HDR_LEN,
                payload: &frame[ETHER_HDR_LEN..],
            })
        }
    }
}

fn mac_at(frame: &[u8], offset: usize) -> MacAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&frame[offset..offset + 6]);
    MacAddress::new(bytes)
}
