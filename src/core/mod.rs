//! Filesystem engine
//!
//! Layers, bottom to top:
//!
//! - [`provider`] - traits the bus transport implements
//! - [`page`] - packet framing, CRC16, page states
//! - [`cache`] - per-group page cache with write-back, redirects and bitmap commit
//! - [`allocator`] - page usage bitmap and its placements
//! - [`header`], [`record`], [`path`] - on-media formats and path parsing
//! - [`descriptor`] - directories, file chains, format and the open descriptor
//! - [`registry`], [`topology`] - cache sharing and multi-device resolution

pub mod allocator;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod header;
pub mod page;
pub mod path;
pub mod provider;
pub mod record;
pub mod registry;
pub mod topology;

pub use cache::{CacheStats, MemoryCache};
pub use config::WireFsConfig;
pub use descriptor::FileDescriptor;
pub use error::{ErrorKind, Result, WireFsError};
pub use page::{PageId, PageState};
pub use provider::{Adapter, Device, DeviceAddress, MemoryBank};
pub use registry::CacheRegistry;
