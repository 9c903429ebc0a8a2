//! Page identifiers, page states and the packet format stored inside a page
//!
//! Packet layout: `[len][data; len][!crc lo][!crc hi]`. The CRC16 (reflected
//! polynomial 0xA001) runs over `[len|data]` seeded with the bank-local page
//! number, so a packet copied to another page no longer validates.

use crate::core::error::{Result, WireFsError};
use crc::{Crc, CRC_16_ARC};
use std::fmt;

/// Bytes a packet adds around its data (length byte + CRC16)
pub const PACKET_OVERHEAD: usize = 3;

/// CRC16 over a complete valid packet, inverted CRC included
pub const CRC16_RESIDUE: u16 = 0xB001;

/// Global page number: index into the concatenation of every bank of every
/// device in a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

impl PageId {
    /// Root directory page
    pub const ROOT: PageId = PageId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Self {
        PageId(index as u32)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a bounded walk is following
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Write-once redirect pointers
    Redirect,
    /// Trailing next-page pointers of directories and files
    Link,
}

/// Bounds a walk over redirect or next-page pointers.
///
/// A filesystem of `total` pages can never legitimately visit more than
/// `total` pages in one chain; the next hop past that is reported as a loop.
#[derive(Debug)]
pub struct ChainGuard {
    kind: ChainKind,
    start: PageId,
    hops: usize,
    limit: usize,
}

impl ChainGuard {
    pub fn new(kind: ChainKind, start: PageId, total_pages: usize) -> Self {
        ChainGuard {
            kind,
            start,
            hops: 0,
            limit: total_pages,
        }
    }

    /// Account for one more hop, onto `next`
    pub fn hop(&mut self, next: PageId) -> Result<PageId> {
        self.hops += 1;
        if self.hops >= self.limit.max(1) {
            let page = self.start.index();
            return Err(match self.kind {
                ChainKind::Redirect => WireFsError::CircularRedirect { page },
                ChainKind::Link => WireFsError::ChainLoop { page },
            });
        }
        Ok(next)
    }

    pub fn hops(&self) -> usize {
        self.hops
    }
}

/// Page state machine of a cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Nothing known about the page
    NotRead,
    /// Content read and validated
    ReadWithCrc,
    /// Content read without packet validation (raw bit test source)
    ReadNoCrc,
    /// Staged write on write-once media, not yet checked against the device
    Verify,
    /// Write-once page whose content moved to another page; pointer not yet committed
    Redirect,
    /// Staged write ready to be programmed
    Write,
}

impl PageState {
    /// States whose slot content can be served without a bus transaction
    pub fn is_trusted(self) -> bool {
        matches!(
            self,
            PageState::ReadWithCrc | PageState::Write | PageState::Verify
        )
    }

    /// States that require the page to sit on the write log
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            PageState::Verify | PageState::Redirect | PageState::Write
        )
    }
}

/// Largest data length the one-byte length field can express
pub const MAX_PACKET_DATA: usize = 255;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC16 as used for page packets, with `seed` loaded into the
/// (reflected) register in place of the usual zero init
pub fn crc16(data: &[u8], seed: u16) -> u16 {
    // The crate reflects the initial value for reflected algorithms.
    let mut digest = CRC16.digest_with_initial(seed.reverse_bits());
    digest.update(data);
    digest.finalize()
}

/// Largest data length a packet in a page of `page_length` bytes can hold
pub fn max_packet_data_length(page_length: usize) -> usize {
    page_length
        .saturating_sub(PACKET_OVERHEAD)
        .min(MAX_PACKET_DATA)
}

/// Frame `data` as a packet for the bank-local page `local_page`
pub fn encode_packet(data: &[u8], local_page: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(data.len() + PACKET_OVERHEAD);
    packet.push(data.len() as u8);
    packet.extend_from_slice(data);
    let crc = !crc16(&packet, local_page as u16);
    packet.push((crc & 0xFF) as u8);
    packet.push((crc >> 8) as u8);
    packet
}

/// Why a raw page did not hold a valid packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    Length(usize),
    Crc,
}

impl PacketError {
    pub fn into_error(self, page: PageId) -> WireFsError {
        match self {
            PacketError::Length(length) => WireFsError::InvalidPacketLength {
                page: page.index(),
                length,
            },
            PacketError::Crc => WireFsError::CrcMismatch { page: page.index() },
        }
    }
}

/// Validate a raw page and return the packet data
pub fn decode_packet(raw: &[u8], local_page: usize) -> std::result::Result<&[u8], PacketError> {
    let Some(&len) = raw.first() else {
        return Err(PacketError::Length(0));
    };
    let len = len as usize;
    if raw.len() < PACKET_OVERHEAD || len > max_packet_data_length(raw.len()) {
        return Err(PacketError::Length(len));
    }
    if crc16(&raw[..len + PACKET_OVERHEAD], local_page as u16) != CRC16_RESIDUE {
        return Err(PacketError::Crc);
    }
    Ok(&raw[1..1 + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(packet: &[u8], page_length: usize, fill: u8) -> Vec<u8> {
        let mut raw = packet.to_vec();
        raw.resize(page_length, fill);
        raw
    }

    #[test]
    fn test_packet_residue() {
        for page in [0usize, 1, 5, 255] {
            let packet = encode_packet(b"HELLO", page);
            assert_eq!(packet.len(), 5 + PACKET_OVERHEAD);
            assert_eq!(crc16(&packet, page as u16), CRC16_RESIDUE);
        }
    }

    #[test]
    fn test_crc16_known_values() {
        assert_eq!(crc16(b"123456789", 0), 0xBB3D);
        assert_eq!(crc16(b"HELLO", 5), 0xE18D);
        assert_eq!(crc16(b"\x05HELLO", 0), 0xB441);
    }

    #[test]
    fn test_length_capped_by_length_byte() {
        assert_eq!(max_packet_data_length(32), 29);
        assert_eq!(max_packet_data_length(258), 255);
        assert_eq!(max_packet_data_length(300), MAX_PACKET_DATA);
        assert_eq!(max_packet_data_length(2), 0);
    }

    #[test]
    fn test_long_page_packet_round_trip() {
        let raw = padded(&encode_packet(&[0x5A; 255], 1), 300, 0xFF);
        assert_eq!(decode_packet(&raw, 1).unwrap(), &[0x5A; 255][..]);
    }

    #[test]
    fn test_packet_decode() {
        let raw = padded(&encode_packet(&[1, 2, 3], 7), 32, 0xFF);
        assert_eq!(decode_packet(&raw, 7).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_packet_seeded_by_page() {
        let raw = padded(&encode_packet(&[1, 2, 3], 7), 32, 0);
        assert_eq!(decode_packet(&raw, 8), Err(PacketError::Crc));
    }

    #[test]
    fn test_packet_bad_length() {
        let mut raw = vec![0u8; 32];
        raw[0] = 30;
        assert_eq!(decode_packet(&raw, 0), Err(PacketError::Length(30)));
    }

    #[test]
    fn test_packet_corruption_detected() {
        let mut raw = padded(&encode_packet(b"DATA", 2), 32, 0);
        raw[3] ^= 0x10;
        assert_eq!(decode_packet(&raw, 2), Err(PacketError::Crc));
    }

    #[test]
    fn test_empty_packet() {
        let raw = padded(&encode_packet(&[], 0), 8, 0);
        assert_eq!(decode_packet(&raw, 0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_chain_guard_limits_hops() {
        let mut guard = ChainGuard::new(ChainKind::Redirect, PageId(3), 4);
        assert!(guard.hop(PageId(1)).is_ok());
        assert!(guard.hop(PageId(2)).is_ok());
        assert!(guard.hop(PageId(3)).is_ok());
        assert!(matches!(
            guard.hop(PageId(1)),
            Err(WireFsError::CircularRedirect { page: 3 })
        ));
    }

    #[test]
    fn test_page_state_classes() {
        assert!(PageState::Write.is_trusted());
        assert!(!PageState::ReadNoCrc.is_trusted());
        assert!(PageState::Redirect.is_dirty());
        assert!(!PageState::ReadWithCrc.is_dirty());
    }
}
