//! Boundary to the bus transport and memory bank layer
//!
//! Everything below these traits (reset, search, speed negotiation, the
//! physical page primitives) is supplied by the caller. The page cache only
//! ever talks to memory through [`MemoryBank`] and selects devices through
//! [`Device`] and [`Adapter`].

use crate::core::error::{TransportError, TransportResult};
use std::fmt;

/// 64-bit bus address of a device (family code, serial, CRC8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        DeviceAddress(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// A page-addressable memory bank on one device
///
/// Page numbers passed to these methods are local to the bank.
pub trait MemoryBank: Send {
    /// Length of one raw page in bytes
    fn page_length(&self) -> usize;

    /// Number of pages in the bank
    fn page_count(&self) -> usize;

    /// Bits can only be programmed from 1 to 0
    fn is_write_once(&self) -> bool;

    fn is_general_purpose(&self) -> bool {
        true
    }

    fn is_non_volatile(&self) -> bool {
        true
    }

    /// Page reads return extra info (the inverted redirect byte on write-once parts)
    fn has_extra_info(&self) -> bool {
        false
    }

    fn extra_info_length(&self) -> usize {
        0
    }

    fn extra_info_description(&self) -> &str {
        ""
    }

    /// The device keeps its own page usage bitmap
    fn has_page_bitmap(&self) -> bool {
        false
    }

    /// Raw page read. `continuing` hints that the previous read was `page - 1`.
    fn read_page(&mut self, page: usize, continuing: bool, buf: &mut [u8]) -> TransportResult<()>;

    /// Page read protected by the device-computed CRC. `extra` receives the
    /// extra info bytes when [`MemoryBank::has_extra_info`] is true.
    fn read_page_crc(
        &mut self,
        page: usize,
        continuing: bool,
        buf: &mut [u8],
        extra: &mut [u8],
    ) -> TransportResult<()>;

    /// Write already framed packet bytes starting at the beginning of `page`
    fn write_page_packet(&mut self, page: usize, buf: &[u8]) -> TransportResult<()>;

    /// Current redirect target of `page`, 0 when not redirected
    fn redirected_page(&mut self, _page: usize) -> TransportResult<usize> {
        Err(TransportError::Unsupported("redirected_page"))
    }

    /// Permanently redirect `page` to `target`
    fn redirect_page(&mut self, _page: usize, _target: usize) -> TransportResult<()> {
        Err(TransportError::Unsupported("redirect_page"))
    }

    /// Read the device usage bitmap (bit = local page, 1 = free)
    fn read_page_bitmap(&mut self, _buf: &mut [u8]) -> TransportResult<()> {
        Err(TransportError::Unsupported("read_page_bitmap"))
    }

    /// Program the device usage bitmap
    fn write_page_bitmap(&mut self, _buf: &[u8]) -> TransportResult<()> {
        Err(TransportError::Unsupported("write_page_bitmap"))
    }
}

/// One device on the bus
pub trait Device: Send {
    fn address(&self) -> DeviceAddress;

    fn bank_count(&self) -> usize;

    fn bank(&mut self, index: usize) -> &mut dyn MemoryBank;

    /// Select the device and negotiate its bus speed
    fn do_speed(&mut self) -> TransportResult<()>;
}

/// Hands out device handles by address
pub trait Adapter: Send + Sync {
    fn device(&self, address: DeviceAddress) -> TransportResult<Box<dyn Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(DeviceAddress(0x1234).to_string(), "0000000000001234");
    }

    #[test]
    fn test_address_bytes() {
        let addr = DeviceAddress(0x0102_0304_0506_0708);
        assert_eq!(DeviceAddress::from_le_bytes(addr.to_le_bytes()), addr);
        assert_eq!(addr.to_le_bytes()[0], 0x08);
    }
}
