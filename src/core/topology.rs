//! Filesystem validation and multi-device topology resolution
//!
//! The root page decides how a device group is read. A satellite stub sends
//! the session to its master; a master's device map fixes the device list.
//! Resolution is a small state machine with a bounded number of re-points:
//!
//! ```text
//! Unresolved --satellite--> Resolving{master} --re-point--> Unresolved
//! Unresolved --master-----> Master --map differs--> re-point --> Unresolved
//!                           Master --map matches--> Resolved
//! Unresolved --single-----> Resolved
//! ```

use crate::core::allocator::{BitmapPlacement, LOCAL_BITMAP_PAGES};
use crate::core::cache::MemoryCache;
use crate::core::descriptor::directory;
use crate::core::descriptor::stream::Cursor;
use crate::core::error::{ErrorKind, Result, WireFsError};
use crate::core::header::{
    FsLayout, PointerWidth, RootHeader, Topology, MAX_TOTAL_PAGES,
};
use crate::core::page::PageId;
use crate::core::provider::DeviceAddress;
use crate::core::record::{EntryKind, EntryName};
use crate::core::registry::{CacheHandle, CacheRegistry};
use tracing::{debug, info};

/// Name of the device map file in the master root
pub const DEVICE_MAP_NAME: &str = "DMAP";
pub const DEVICE_MAP_EXTENSION: u8 = 100;

/// Re-points one resolution may perform (satellite to master, then the
/// device list of the master)
const MAX_REPOINTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopologyState {
    Unresolved,
    Resolving { master: DeviceAddress },
    Master { header: RootHeader },
    Resolved,
}

pub fn device_map_name() -> EntryName {
    EntryName::new(DEVICE_MAP_NAME, EntryKind::File(DEVICE_MAP_EXTENSION))
}

pub fn encode_device_map(satellites: &[DeviceAddress]) -> Vec<u8> {
    satellites.iter().flat_map(|a| a.to_le_bytes()).collect()
}

pub fn decode_device_map(bytes: &[u8]) -> Result<Vec<DeviceAddress>> {
    if bytes.len() % 8 != 0 {
        return Err(WireFsError::InvalidFilesystem(format!(
            "device map length {} is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut addr = [0u8; 8];
            addr.copy_from_slice(chunk);
            DeviceAddress::from_le_bytes(addr)
        })
        .collect())
}

/// Decode the root page, reporting an unreadable root as an invalid filesystem
pub fn read_root_header(cache: &mut MemoryCache) -> Result<RootHeader> {
    let data = match cache.read_page_packet(PageId::ROOT) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::Corruption => {
            return Err(WireFsError::InvalidFilesystem(format!(
                "unreadable root directory: {}",
                e
            )))
        }
        Err(e) => return Err(e),
    };
    RootHeader::decode(&data)
}

/// Satellite addresses listed in the device map of a master root
pub fn read_device_map(cache: &mut MemoryCache, layout: FsLayout) -> Result<Vec<DeviceAddress>> {
    let entry = directory::find(cache, layout, PageId::ROOT, &device_map_name())?
        .ok_or_else(|| {
            WireFsError::InvalidFilesystem("multi-device filesystem has no device map".to_string())
        })?;
    let mut cursor = Cursor::new(entry.record.start);
    let mut bytes = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = cursor.read(cache, layout, &mut buf)?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
    }
    decode_device_map(&bytes)
}

/// Check the header against the cache and load the page bitmap
fn install(cache: &mut MemoryCache, header: &RootHeader) -> Result<()> {
    let total = cache.total_pages();
    if total > MAX_TOTAL_PAGES {
        return Err(WireFsError::InvalidFilesystem(format!(
            "{} pages exceed the addressable {}",
            total, MAX_TOTAL_PAGES
        )));
    }
    if header.width != PointerWidth::for_total_pages(total) {
        return Err(WireFsError::InvalidFilesystem(format!(
            "{}-byte page pointers do not match {} pages",
            header.width.bytes(),
            total
        )));
    }
    match header.bitmap {
        BitmapPlacement::Engine if !cache.device_tracks_usage() => {
            return Err(WireFsError::InvalidFilesystem(
                "device-kept page bitmap on memory without one".to_string(),
            ))
        }
        BitmapPlacement::Local if total > LOCAL_BITMAP_PAGES => {
            return Err(WireFsError::InvalidFilesystem(format!(
                "local page bitmap cannot cover {} pages",
                total
            )))
        }
        BitmapPlacement::File { start, pages } if start.index() >= total || pages == 0 => {
            return Err(WireFsError::InvalidFilesystem(format!(
                "bitmap file at page {} ({} pages) out of range",
                start, pages
            )))
        }
        BitmapPlacement::Local | BitmapPlacement::File { .. } if cache.is_write_once() => {
            return Err(WireFsError::InvalidFilesystem(
                "write-once filesystem without a device-kept page bitmap".to_string(),
            ))
        }
        _ => {}
    }
    cache.set_layout(Some(header.layout()));
    if let Err(e) = cache.load_bitmap() {
        cache.set_layout(None);
        return Err(e);
    }
    Ok(())
}

/// Move `handle` to the cache of `addresses`. Without `exact` any cache led
/// by `addresses[0]` is joined as is.
fn repoint(
    registry: &CacheRegistry,
    handle: &mut CacheHandle,
    addresses: &[DeviceAddress],
    exact: bool,
    repoints: &mut usize,
) -> Result<()> {
    *repoints += 1;
    if *repoints > MAX_REPOINTS {
        return Err(WireFsError::InvalidFilesystem(
            "device topology does not settle".to_string(),
        ));
    }
    let next = if exact {
        registry.acquire_exact(addresses, handle.owner())?
    } else {
        registry.acquire(addresses, handle.owner())?
    };
    let previous = std::mem::replace(handle, next);
    registry.release(&previous);
    info!(
        "Re-pointed filesystem from {} to {} ({} devices)",
        previous.key(),
        handle.key(),
        addresses.len()
    );
    Ok(())
}

/// Resolve the topology of the group behind `handle`, re-pointing the handle
/// at the master device group when needed. On success the cache has its
/// layout and page bitmap installed.
pub fn resolve(registry: &CacheRegistry, handle: &mut CacheHandle) -> Result<FsLayout> {
    let mut state = TopologyState::Unresolved;
    let mut repoints = 0;
    let mut via_satellite = false;

    loop {
        state = match state {
            TopologyState::Unresolved => {
                let mut cache = handle.lock();
                if cache.layout().is_some() && cache.bitmap().is_some() {
                    TopologyState::Resolved
                } else {
                    let header = read_root_header(&mut cache)?;
                    match header.topology {
                        Topology::Single if cache.addresses().len() > 1 => {
                            let first = [cache.addresses()[0]];
                            drop(cache);
                            repoint(registry, handle, &first, true, &mut repoints)?;
                            TopologyState::Unresolved
                        }
                        Topology::Single => {
                            install(&mut cache, &header)?;
                            TopologyState::Resolved
                        }
                        Topology::Satellite { .. } if via_satellite => {
                            return Err(WireFsError::InvalidFilesystem(
                                "satellite points to another satellite".to_string(),
                            ))
                        }
                        Topology::Satellite { master } => TopologyState::Resolving { master },
                        Topology::Master => TopologyState::Master { header },
                    }
                }
            }
            TopologyState::Resolving { master } => {
                debug!("Device {} is a satellite of {}", handle.key(), master);
                via_satellite = true;
                repoint(registry, handle, &[master], false, &mut repoints)?;
                TopologyState::Unresolved
            }
            TopologyState::Master { header } => {
                let mut cache = handle.lock();
                cache.set_layout(Some(header.layout()));
                let expected = match read_device_map(&mut cache, header.layout()) {
                    Ok(satellites) => {
                        let mut expected = vec![cache.addresses()[0]];
                        expected.extend(satellites);
                        expected
                    }
                    Err(e) => {
                        cache.set_layout(None);
                        return Err(e);
                    }
                };
                if cache.addresses() == expected.as_slice() {
                    install(&mut cache, &header)?;
                    TopologyState::Resolved
                } else {
                    info!(
                        "Device map of {} lists {} devices, session has {}",
                        handle.key(),
                        expected.len(),
                        cache.addresses().len()
                    );
                    cache.set_layout(None);
                    drop(cache);
                    repoint(registry, handle, &expected, true, &mut repoints)?;
                    TopologyState::Unresolved
                }
            }
            TopologyState::Resolved => {
                let cache = handle.lock();
                return cache.layout().ok_or_else(|| {
                    WireFsError::InvalidFilesystem("filesystem layout not resolved".to_string())
                });
            }
        };
    }
}
