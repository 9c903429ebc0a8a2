//! # wirefs - filesystem over page-addressable bus memory
//!
//! A small hierarchical filesystem living on the memory banks of devices
//! reached through a slow, shared serial bus. It works on ordinary
//! rewritable memory and on write-once memory, whose bits only ever go from
//! 1 to 0.
//!
//! - **Page cache** with a write log, CRC16-checked packets and retries of
//!   transient bus corruption
//! - **Write-once redirection**: a page that cannot be reprogrammed is
//!   redirected to a fresh page instead of being rewritten
//! - **Three page bitmap placements**: device-kept, inside the root
//!   directory, or a bitmap file
//! - **Multi-device filesystems** with a master root, satellite stubs and a
//!   device map
//!
//! The bus transport itself is not part of this crate: implement
//! [`MemoryBank`], [`Device`] and [`Adapter`] for it. [`sim`] provides an
//! in-memory bus for tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use wirefs::sim::{SimBus, SimDevice};
//! use wirefs::{CacheRegistry, DeviceAddress, WireFile, WireFsConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let address = DeviceAddress(0x2D00_0000_1234_5601);
//! let bus = SimBus::new(vec![SimDevice::rewritable(address, 16, 32)]);
//! let registry = CacheRegistry::new(Arc::new(bus), WireFsConfig::default());
//!
//! let root = WireFile::new(registry.clone(), &[address], "/")?;
//! root.format()?;
//!
//! let file = root.child("DEMO.0")?;
//! let mut writer = file.writer(false)?;
//! writer.write_all(b"hello bus")?;
//! writer.close()?;
//!
//! let mut text = String::new();
//! file.reader()?.read_to_string(&mut text)?;
//! assert_eq!(text, "hello bus");
//! # Ok(())
//! # }
//! ```
//!
//! ## On-device layout
//!
//! ```text
//! page packet   [len][data ...][~crc lo][~crc hi]
//! page data     [payload or records ...][next page pointer]
//! root page     [control field (7)][entry records ...][next]
//! entry record  [name (4)][extension][start page][page count]
//! ```
//!
//! Page pointers are one byte wide up to 256 pages, two bytes above.

pub mod core;
pub mod file;
pub mod sim;

pub use crate::core::{
    cache::{CacheStats, MemoryCache},
    config::WireFsConfig,
    descriptor::FileDescriptor,
    error::{ErrorKind, Result, TransportError, WireFsError},
    page::{PageId, PageState},
    provider::{Adapter, Device, DeviceAddress, MemoryBank},
    record::{EntryKind, EntryRecord},
    registry::CacheRegistry,
};
pub use file::{FileReader, FileWriter, WireFile};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
