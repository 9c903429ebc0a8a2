//! Formatting a device group
//!
//! Writes a fresh root directory, picks the bitmap placement and, for more
//! than one device, writes the satellite stubs and the device map.

use super::directory;
use super::stream::{self, Cursor};
use crate::core::allocator::{BitmapPlacement, PageAllocator, PageBitmap, LOCAL_BITMAP_PAGES};
use crate::core::cache::MemoryCache;
use crate::core::error::{Result, WireFsError};
use crate::core::header::{FsLayout, PointerWidth, RootHeader, Topology, MAX_TOTAL_PAGES};
use crate::core::page::PageId;
use crate::core::provider::DeviceAddress;
use crate::core::record::EntryRecord;
use crate::core::topology::{device_map_name, encode_device_map};
use tracing::info;

/// Format every device of `cache` as one filesystem and flush it.
/// Unflushed writes of the previous filesystem are discarded.
pub fn format(cache: &mut MemoryCache) -> Result<FsLayout> {
    cache.invalidate();
    cache.set_layout(None);

    let total = cache.total_pages();
    if total > MAX_TOTAL_PAGES {
        return Err(WireFsError::Capacity(format!(
            "{} pages exceed the addressable {}",
            total, MAX_TOTAL_PAGES
        )));
    }
    let width = PointerWidth::for_total_pages(total);
    let addresses = cache.addresses().to_vec();
    let multi_device = addresses.len() > 1;

    let mut bitmap = if cache.is_write_once() {
        if !cache.device_tracks_usage() {
            return Err(WireFsError::InvalidFilesystem(
                "write-once memory without a device-kept page bitmap".to_string(),
            ));
        }
        PageBitmap::from_image(cache.read_engine_bitmap()?, total, true)
    } else {
        PageBitmap::new(total, false)
    };
    bitmap.mark_used(PageId::ROOT)?;

    let mut satellite_roots = Vec::new();
    for device in 1..addresses.len() {
        let root = cache.device_first_page(device).ok_or_else(|| {
            WireFsError::Capacity(format!("device {} has no memory for a root", addresses[device]))
        })?;
        bitmap.mark_used(root)?;
        satellite_roots.push(root);
    }

    let mut bitmap_file = Vec::new();
    if !cache.is_write_once() && total > LOCAL_BITMAP_PAGES {
        let need = PageBitmap::byte_len(total);
        let mut covered = 0;
        while covered < need {
            let page = bitmap.next_free_page().ok_or_else(|| {
                WireFsError::Capacity("no room for the page bitmap".to_string())
            })?;
            bitmap.mark_used(page)?;
            covered += cache.max_data_length(page)?.saturating_sub(width.bytes());
            bitmap_file.push(page);
        }
    }
    let placement = BitmapPlacement::select(
        cache.is_write_once(),
        total,
        bitmap_file.first().copied().unwrap_or(PageId(0)),
        bitmap_file.len(),
    );

    let topology = if multi_device {
        Topology::Master
    } else {
        Topology::Single
    };
    let header = RootHeader::new(width, topology, placement);
    let layout = header.layout();
    cache.set_layout(Some(layout));
    cache.install_bitmap(bitmap, bitmap_file);
    cache.write_page_packet(PageId::ROOT, &header.to_root_data())?;

    if multi_device {
        let master = addresses[0];
        for &root in &satellite_roots {
            let stub = RootHeader::new(width, Topology::Satellite { master }, BitmapPlacement::Local);
            cache.write_page_packet(root, &stub.to_root_data())?;
        }
        write_device_map(cache, layout, &addresses[1..])?;
    }

    cache.sync()?;
    info!(
        "Formatted {} devices, {} pages, {}-byte pointers, {:?} bitmap",
        addresses.len(),
        total,
        width.bytes(),
        placement
    );
    Ok(layout)
}

fn write_device_map(
    cache: &mut MemoryCache,
    layout: FsLayout,
    satellites: &[DeviceAddress],
) -> Result<()> {
    let start = stream::create_file_page(cache, layout)?;
    let mut cursor = Cursor::new(start);
    cursor.write(cache, layout, &encode_device_map(satellites))?;
    let record = EntryRecord::new(device_map_name(), start, 1 + cursor.take_added());
    directory::append(cache, layout, PageId::ROOT, record)?;
    Ok(())
}
