//! Directory control field (first 7 bytes of the root page and of the first
//! page of every directory)
//!
//! ```text
//! byte 0   marker: low nibble 0xA = 1-byte page pointers, 0xB = 2-byte
//!                  high nibble 0xA = single device, 0xB = multi-device master
//! byte 1   flags:  0x80 bitmap file, 0x40 device-managed bitmap, 0x01 satellite
//! byte 2   reserved (root) / parent directory start page (sub-directory)
//! 3..7     root: local bitmap (pages 0..31) or bitmap file start + page count
//! ```
//!
//! A satellite root carries the 8-byte address of its master right after the
//! control field.

use crate::core::allocator::{BitmapPlacement, LOCAL_BITMAP_BYTES};
use crate::core::error::{Result, WireFsError};
use crate::core::page::PageId;
use crate::core::provider::DeviceAddress;

/// Length of a directory control field
pub const CONTROL_LEN: usize = 7;

pub const FLAG_BITMAP_FILE: u8 = 0x80;
pub const FLAG_BITMAP_ENGINE: u8 = 0x40;
pub const FLAG_SATELLITE: u8 = 0x01;

const WIDTH_ONE: u8 = 0x0A;
const WIDTH_TWO: u8 = 0x0B;
const TOPOLOGY_SINGLE: u8 = 0xA0;
const TOPOLOGY_MASTER: u8 = 0xB0;

/// Offset of the local bitmap / bitmap file pointers in the root control field
const ROOT_BITMAP_OFFSET: usize = 3;

/// Largest filesystem two-byte page pointers can address
pub const MAX_TOTAL_PAGES: usize = PointerWidth::Two.max_value() + 1;

/// Size of a page pointer on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    One,
    Two,
}

impl PointerWidth {
    /// Width needed to address `total_pages`
    pub fn for_total_pages(total_pages: usize) -> Self {
        if total_pages <= PointerWidth::One.max_value() + 1 {
            PointerWidth::One
        } else {
            PointerWidth::Two
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::One => 1,
            PointerWidth::Two => 2,
        }
    }

    /// Largest value a pointer field can hold
    pub const fn max_value(self) -> usize {
        match self {
            PointerWidth::One => 0xFF,
            PointerWidth::Two => 0xFFFF,
        }
    }

    pub fn read(self, bytes: &[u8]) -> u32 {
        match self {
            PointerWidth::One => bytes[0] as u32,
            PointerWidth::Two => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        }
    }

    pub fn write(self, value: u32, out: &mut [u8]) {
        match self {
            PointerWidth::One => out[0] = value as u8,
            PointerWidth::Two => out[..2].copy_from_slice(&(value as u16).to_le_bytes()),
        }
    }

    /// Encode as a fresh byte vector
    pub fn encode(self, value: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.bytes()];
        self.write(value, &mut out);
        out
    }

    /// Size of one directory entry record with this pointer width
    pub fn entry_len(self) -> usize {
        5 + 2 * self.bytes()
    }
}

/// Role of the device holding a root page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Single,
    Master,
    Satellite { master: DeviceAddress },
}

/// Geometry of a resolved filesystem session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsLayout {
    pub width: PointerWidth,
    pub multi_device: bool,
    pub bitmap: BitmapPlacement,
}

impl FsLayout {
    pub fn entry_len(&self) -> usize {
        self.width.entry_len()
    }

    pub fn pointer_len(&self) -> usize {
        self.width.bytes()
    }
}

/// Decoded root directory header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHeader {
    pub width: PointerWidth,
    pub topology: Topology,
    pub bitmap: BitmapPlacement,
    /// Local bitmap bytes (meaningful with [`BitmapPlacement::Local`])
    pub local_bitmap: [u8; LOCAL_BITMAP_BYTES],
}

impl RootHeader {
    pub fn new(width: PointerWidth, topology: Topology, bitmap: BitmapPlacement) -> Self {
        RootHeader {
            width,
            topology,
            bitmap,
            local_bitmap: [0; LOCAL_BITMAP_BYTES],
        }
    }

    fn marker(width: PointerWidth, master: bool) -> u8 {
        let low = match width {
            PointerWidth::One => WIDTH_ONE,
            PointerWidth::Two => WIDTH_TWO,
        };
        let high = if master { TOPOLOGY_MASTER } else { TOPOLOGY_SINGLE };
        high | low
    }

    /// Control field bytes
    pub fn to_control(&self) -> [u8; CONTROL_LEN] {
        let mut control = [0u8; CONTROL_LEN];
        control[0] = Self::marker(self.width, self.topology == Topology::Master);
        match self.bitmap {
            BitmapPlacement::Engine => control[1] |= FLAG_BITMAP_ENGINE,
            BitmapPlacement::Local => {
                control[ROOT_BITMAP_OFFSET..ROOT_BITMAP_OFFSET + LOCAL_BITMAP_BYTES]
                    .copy_from_slice(&self.local_bitmap);
            }
            BitmapPlacement::File { start, pages } => {
                control[1] |= FLAG_BITMAP_FILE;
                let n = self.width.bytes();
                let at = ROOT_BITMAP_OFFSET;
                self.width.write(start.0, &mut control[at..at + n]);
                self.width.write(pages as u32, &mut control[at + n..at + 2 * n]);
            }
        }
        if matches!(self.topology, Topology::Satellite { .. }) {
            control[1] |= FLAG_SATELLITE;
        }
        control
    }

    /// Full packet data of a root page holding no entries
    pub fn to_root_data(&self) -> Vec<u8> {
        let mut data = self.to_control().to_vec();
        if let Topology::Satellite { master } = self.topology {
            data.extend_from_slice(&master.to_le_bytes());
        }
        data.extend(self.width.encode(0));
        data
    }

    /// Decode the packet data of a root page
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CONTROL_LEN {
            return Err(WireFsError::InvalidFilesystem(format!(
                "root directory packet too short ({} bytes)",
                data.len()
            )));
        }
        let marker = data[0];
        let width = match marker & 0x0F {
            WIDTH_ONE => PointerWidth::One,
            WIDTH_TWO => PointerWidth::Two,
            _ => {
                return Err(WireFsError::InvalidFilesystem(format!(
                    "bad directory marker 0x{:02X}",
                    marker
                )))
            }
        };
        let master = match marker & 0xF0 {
            TOPOLOGY_SINGLE => false,
            TOPOLOGY_MASTER => true,
            _ => {
                return Err(WireFsError::InvalidFilesystem(format!(
                    "bad topology marker 0x{:02X}",
                    marker
                )))
            }
        };

        let flags = data[1];
        let topology = if flags & FLAG_SATELLITE != 0 {
            if master {
                return Err(WireFsError::InvalidFilesystem(
                    "satellite back-link on a multi-device master".to_string(),
                ));
            }
            let bytes = data.get(CONTROL_LEN..CONTROL_LEN + 8).ok_or_else(|| {
                WireFsError::InvalidFilesystem("satellite root lacks master address".to_string())
            })?;
            let mut addr = [0u8; 8];
            addr.copy_from_slice(bytes);
            Topology::Satellite {
                master: DeviceAddress::from_le_bytes(addr),
            }
        } else if master {
            Topology::Master
        } else {
            Topology::Single
        };

        let mut local_bitmap = [0u8; LOCAL_BITMAP_BYTES];
        let bitmap = if flags & FLAG_BITMAP_ENGINE != 0 {
            BitmapPlacement::Engine
        } else if flags & FLAG_BITMAP_FILE != 0 {
            let n = width.bytes();
            let at = ROOT_BITMAP_OFFSET;
            BitmapPlacement::File {
                start: PageId(width.read(&data[at..at + n])),
                pages: width.read(&data[at + n..at + 2 * n]) as usize,
            }
        } else {
            local_bitmap.copy_from_slice(
                &data[ROOT_BITMAP_OFFSET..ROOT_BITMAP_OFFSET + LOCAL_BITMAP_BYTES],
            );
            BitmapPlacement::Local
        };

        Ok(RootHeader {
            width,
            topology,
            bitmap,
            local_bitmap,
        })
    }

    pub fn layout(&self) -> FsLayout {
        FsLayout {
            width: self.width,
            multi_device: self.topology == Topology::Master,
            bitmap: self.bitmap,
        }
    }
}

/// Byte range of the local bitmap inside root packet data
pub fn local_bitmap_range() -> std::ops::Range<usize> {
    ROOT_BITMAP_OFFSET..ROOT_BITMAP_OFFSET + LOCAL_BITMAP_BYTES
}

/// Control field of a sub-directory's first page
pub fn subdirectory_control(width: PointerWidth, parent: PageId) -> [u8; CONTROL_LEN] {
    let mut control = [0u8; CONTROL_LEN];
    control[0] = RootHeader::marker(width, false);
    width.write(parent.0, &mut control[2..2 + width.bytes()]);
    control
}

/// Parent directory start page recorded in a sub-directory control field
pub fn subdirectory_parent(width: PointerWidth, control: &[u8]) -> PageId {
    PageId(width.read(&control[2..2 + width.bytes()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_width_selection() {
        assert_eq!(PointerWidth::for_total_pages(256), PointerWidth::One);
        assert_eq!(PointerWidth::for_total_pages(257), PointerWidth::Two);
        assert_eq!(PointerWidth::One.entry_len(), 7);
        assert_eq!(PointerWidth::Two.entry_len(), 9);
    }

    #[test]
    fn test_pointer_encoding() {
        let mut buf = [0u8; 2];
        PointerWidth::Two.write(0x1234, &mut buf);
        assert_eq!(buf, [0x34, 0x12]);
        assert_eq!(PointerWidth::Two.read(&buf), 0x1234);
        assert_eq!(PointerWidth::One.encode(7), vec![7]);
    }

    #[test]
    fn test_single_local_header() {
        let mut header = RootHeader::new(PointerWidth::One, Topology::Single, BitmapPlacement::Local);
        header.local_bitmap = [0x03, 0, 0, 0x80];
        let data = header.to_root_data();
        assert_eq!(data.len(), CONTROL_LEN + 1);
        assert_eq!(data[0], 0xAA);
        assert_eq!(RootHeader::decode(&data).unwrap(), header);
    }

    #[test]
    fn test_master_file_bitmap_header() {
        let header = RootHeader::new(
            PointerWidth::Two,
            Topology::Master,
            BitmapPlacement::File {
                start: PageId(1),
                pages: 3,
            },
        );
        let data = header.to_root_data();
        assert_eq!(data[0], 0xBB);
        assert_eq!(data[1], FLAG_BITMAP_FILE);
        let decoded = RootHeader::decode(&data).unwrap();
        assert_eq!(decoded.bitmap, header.bitmap);
        assert!(decoded.layout().multi_device);
    }

    #[test]
    fn test_satellite_header() {
        let master = DeviceAddress(0xAB00_0000_0000_0042);
        let header = RootHeader::new(
            PointerWidth::One,
            Topology::Satellite { master },
            BitmapPlacement::Local,
        );
        let data = header.to_root_data();
        assert_eq!(data.len(), CONTROL_LEN + 8 + 1);
        let decoded = RootHeader::decode(&data).unwrap();
        assert_eq!(decoded.topology, Topology::Satellite { master });
    }

    #[test]
    fn test_bad_marker_rejected() {
        let data = [0x00u8; 8];
        assert!(matches!(
            RootHeader::decode(&data),
            Err(WireFsError::InvalidFilesystem(_))
        ));
        assert!(RootHeader::decode(&[0xAA, 0, 0]).is_err());
    }

    #[test]
    fn test_subdirectory_control() {
        let control = subdirectory_control(PointerWidth::Two, PageId(300));
        assert_eq!(subdirectory_parent(PointerWidth::Two, &control), PageId(300));
    }
}
