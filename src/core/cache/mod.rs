//! Page cache shared by every descriptor of one filesystem
//!
//! One slot per global page number. Reads are served from trusted slots or
//! read through to the device and validated; writes are staged in slots and
//! queued on the [`WriteLog`] until [`MemoryCache::sync`] commits them.
//!
//! On write-once media a staged page is not written blindly: the flush first
//! checks that the new bytes can be programmed over what the device holds
//! (no bit may go from 0 back to 1) and otherwise moves the content to a
//! fresh page and redirects the old one to it.

mod sync;
pub mod write_log;

use crate::core::allocator::{BitmapPlacement, PageAllocator, PageBitmap, LOCAL_BITMAP_BYTES};
use crate::core::config::WireFsConfig;
use crate::core::error::{Result, TransportError, WireFsError};
use crate::core::header::{local_bitmap_range, FsLayout};
use crate::core::page::{
    decode_packet, encode_packet, max_packet_data_length, ChainGuard, ChainKind, PageId,
    PageState, PACKET_OVERHEAD,
};
use crate::core::provider::{Device, DeviceAddress, MemoryBank};
use ahash::AHashSet;
use tracing::{debug, warn};

pub use write_log::WriteLog;

/// Identifies one owner (descriptor) of a shared cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// Location of one memory bank in the global page space
#[derive(Debug, Clone)]
pub struct BankRef {
    pub device: usize,
    pub bank: usize,
    pub first_page: usize,
    pub page_count: usize,
    pub page_length: usize,
    pub write_once: bool,
    pub extra_info: bool,
    pub extra_info_length: usize,
    pub page_bitmap: bool,
}

impl BankRef {
    /// `page` lies in this bank
    pub fn contains(&self, page: PageId) -> bool {
        let index = page.index();
        index >= self.first_page && index < self.first_page + self.page_count
    }

    /// Bank-local number of the global `page`
    pub fn local(&self, page: PageId) -> usize {
        page.index() - self.first_page
    }

    pub fn global(&self, local: usize) -> PageId {
        PageId::from_index(self.first_page + local)
    }

    pub fn max_data_length(&self) -> usize {
        max_packet_data_length(self.page_length)
    }
}

/// Cached state of one page
#[derive(Debug, Clone)]
struct PageSlot {
    state: PageState,
    /// Raw page bytes (packet at the front)
    content: Vec<u8>,
    /// Data length of the packet in `content`
    packet_len: usize,
    /// Global redirect target, 0 = not redirected
    redirect: u32,
}

impl PageSlot {
    fn new(page_length: usize) -> Self {
        PageSlot {
            state: PageState::NotRead,
            content: vec![0u8; page_length],
            packet_len: 0,
            redirect: 0,
        }
    }

    fn packet(&self) -> &[u8] {
        &self.content[..self.packet_len + PACKET_OVERHEAD]
    }

    fn data(&self) -> &[u8] {
        &self.content[1..1 + self.packet_len]
    }

    fn stage(&mut self, packet: &[u8], fill: u8) {
        self.content.fill(fill);
        self.content[..packet.len()].copy_from_slice(packet);
        self.packet_len = packet.len() - PACKET_OVERHEAD;
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Pages read from a device
    pub page_reads: u64,
    /// Read attempts repeated after a CRC failure
    pub read_retries: u64,
    /// Packets physically written
    pub page_writes: u64,
    /// Pages moved to a fresh page during flush
    pub redirects: u64,
    /// Device usage bitmap commits
    pub bitmap_commits: u64,
}

/// Page cache of one filesystem instance
pub struct MemoryCache {
    config: WireFsConfig,
    devices: Vec<Box<dyn Device>>,
    addresses: Vec<DeviceAddress>,
    banks: Vec<BankRef>,
    slots: Vec<PageSlot>,
    write_log: WriteLog,
    total_pages: usize,
    write_once: bool,
    last_read: Option<PageId>,
    last_written_device: Option<usize>,
    layout: Option<FsLayout>,
    bitmap: Option<PageBitmap>,
    /// Pages of the bitmap file, in chain order
    bitmap_file: Vec<PageId>,
    owners: AHashSet<OwnerId>,
    open_for_write: AHashSet<String>,
    stats: CacheStats,
}

impl MemoryCache {
    /// Build a cache over the general-purpose non-volatile banks of `devices`,
    /// in device order then bank order.
    pub fn new(mut devices: Vec<Box<dyn Device>>, config: WireFsConfig) -> Result<Self> {
        config.validate()?;
        let mut banks = Vec::new();
        let mut first_page = 0usize;
        for (device_index, device) in devices.iter_mut().enumerate() {
            for bank_index in 0..device.bank_count() {
                let bank = device.bank(bank_index);
                if !bank.is_general_purpose() || !bank.is_non_volatile() {
                    continue;
                }
                let page_count = bank.page_count();
                banks.push(BankRef {
                    device: device_index,
                    bank: bank_index,
                    first_page,
                    page_count,
                    page_length: bank.page_length(),
                    write_once: bank.is_write_once(),
                    extra_info: bank.has_extra_info(),
                    extra_info_length: bank.extra_info_length(),
                    page_bitmap: bank.has_page_bitmap(),
                });
                first_page += page_count;
            }
        }

        if banks.is_empty() || first_page == 0 {
            return Err(WireFsError::InvalidFilesystem(
                "no general-purpose memory on the devices".to_string(),
            ));
        }
        let write_once = banks[0].write_once;
        if banks.iter().any(|b| b.write_once != write_once) {
            return Err(WireFsError::InvalidFilesystem(
                "cannot mix write-once and rewritable memory in one filesystem".to_string(),
            ));
        }
        if banks.iter().any(|b| b.max_data_length() <= PACKET_OVERHEAD) {
            return Err(WireFsError::InvalidFilesystem(
                "page length too small for packets".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(first_page);
        for bank in &banks {
            for _ in 0..bank.page_count {
                slots.push(PageSlot::new(bank.page_length));
            }
        }
        let addresses = devices.iter().map(|d| d.address()).collect();

        debug!(
            "Page cache over {} devices, {} banks, {} pages (write-once: {})",
            devices.len(),
            banks.len(),
            first_page,
            write_once
        );

        Ok(MemoryCache {
            config,
            devices,
            addresses,
            banks,
            slots,
            write_log: WriteLog::new(),
            total_pages: first_page,
            write_once,
            last_read: None,
            last_written_device: None,
            layout: None,
            bitmap: None,
            bitmap_file: Vec::new(),
            owners: AHashSet::new(),
            open_for_write: AHashSet::new(),
            stats: CacheStats::default(),
        })
    }

    /// Pages across every bank of every device
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// The devices hold write-once memory
    pub fn is_write_once(&self) -> bool {
        self.write_once
    }

    /// Device addresses in join order
    pub fn addresses(&self) -> &[DeviceAddress] {
        &self.addresses
    }

    /// Banks in global page order
    pub fn banks(&self) -> &[BankRef] {
        &self.banks
    }

    pub fn config(&self) -> &WireFsConfig {
        &self.config
    }

    /// Snapshot of the diagnostic counters
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Pages staged and not yet flushed
    pub fn write_log(&self) -> &WriteLog {
        &self.write_log
    }

    /// State of the slot for `page`, `None` when out of range
    pub fn page_state(&self, page: PageId) -> Option<PageState> {
        self.slots.get(page.index()).map(|s| s.state)
    }

    /// Redirect target known to the cache for `page`
    pub fn redirect_of(&self, page: PageId) -> Option<PageId> {
        self.slots
            .get(page.index())
            .and_then(|s| (s.redirect != 0).then_some(PageId(s.redirect)))
    }

    /// Every bank supports a device-kept usage bitmap
    pub fn device_tracks_usage(&self) -> bool {
        self.write_once && self.banks.iter().all(|b| b.page_bitmap)
    }

    /// Bank holding the global page `page`
    pub fn bank_of(&self, page: PageId) -> Result<&BankRef> {
        self.banks
            .iter()
            .find(|b| b.contains(page))
            .ok_or(WireFsError::PageOutOfRange {
                page: page.index(),
                total: self.total_pages,
            })
    }

    /// Largest packet data length of `page`
    pub fn max_data_length(&self, page: PageId) -> Result<usize> {
        Ok(self.bank_of(page)?.max_data_length())
    }

    /// First global page of the device at `device_index`
    pub fn device_first_page(&self, device_index: usize) -> Option<PageId> {
        self.banks
            .iter()
            .find(|b| b.device == device_index)
            .map(|b| PageId::from_index(b.first_page))
    }

    fn bank_mut(&mut self, bank: &BankRef) -> &mut dyn MemoryBank {
        self.devices[bank.device].bank(bank.bank)
    }

    fn continuing(&self, page: PageId, bank: &BankRef) -> bool {
        self.config.sequential_reads
            && page.index() > bank.first_page
            && self.last_read == Some(PageId::from_index(page.index() - 1))
    }

    // ---- owners and writers -------------------------------------------------

    /// Record `owner` as a user of this cache
    pub fn add_owner(&mut self, owner: OwnerId) {
        self.owners.insert(owner);
    }

    /// Remove `owner`; true when no owner is left
    pub fn remove_owner(&mut self, owner: OwnerId) -> bool {
        self.owners.remove(&owner);
        self.owners.is_empty()
    }

    /// Number of live owners
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Register `path` as open for write
    pub fn claim_writer(&mut self, path: &str) -> Result<()> {
        if !self.open_for_write.insert(path.to_string()) {
            return Err(WireFsError::AlreadyOpenForWrite {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Forget the write claim on `path`
    pub fn release_writer(&mut self, path: &str) {
        self.open_for_write.remove(path);
    }

    /// A writer currently holds `path`
    pub fn is_open_for_write(&self, path: &str) -> bool {
        self.open_for_write.contains(path)
    }

    // ---- layout and allocation ---------------------------------------------

    /// Geometry of the mounted filesystem, if any
    pub fn layout(&self) -> Option<FsLayout> {
        self.layout
    }

    /// Install the geometry of the session without loading a bitmap yet
    pub fn set_layout(&mut self, layout: Option<FsLayout>) {
        self.layout = layout;
        if layout.is_none() {
            self.bitmap = None;
            self.bitmap_file.clear();
        }
    }

    fn require_layout(&self) -> Result<FsLayout> {
        self.layout.ok_or_else(|| {
            WireFsError::InvalidFilesystem("filesystem layout not resolved".to_string())
        })
    }

    /// Load the page bitmap for the installed layout from the device
    pub fn load_bitmap(&mut self) -> Result<()> {
        let layout = self.require_layout()?;
        let total = self.total_pages;
        self.bitmap_file.clear();
        let bitmap = match layout.bitmap {
            BitmapPlacement::Engine => {
                let image = self.read_engine_bitmap()?;
                PageBitmap::from_image(image, total, true)
            }
            BitmapPlacement::Local => {
                let root = self.read_page_packet(PageId::ROOT)?;
                let image = root
                    .get(local_bitmap_range())
                    .map(|b| b.to_vec())
                    .unwrap_or_else(|| vec![0; LOCAL_BITMAP_BYTES]);
                PageBitmap::from_image(image, total, false)
            }
            BitmapPlacement::File { start, pages } => {
                let (image, chain) = self.read_bitmap_file(layout, start, pages)?;
                self.bitmap_file = chain;
                PageBitmap::from_image(image, total, false)
            }
        };
        debug!(
            "Loaded {:?} page bitmap, {} of {} pages free",
            layout.bitmap,
            bitmap.number_free_pages(),
            total
        );
        self.bitmap = Some(bitmap);
        Ok(())
    }

    /// Replace the bitmap (format). `file_pages` lists the bitmap file chain
    /// when the bitmap lives in a file.
    pub fn install_bitmap(&mut self, bitmap: PageBitmap, file_pages: Vec<PageId>) {
        self.bitmap = Some(bitmap);
        self.bitmap_file = file_pages;
    }

    /// Loaded page bitmap
    pub fn bitmap(&self) -> Option<&PageBitmap> {
        self.bitmap.as_ref()
    }

    fn bitmap_mut(&mut self) -> Result<&mut PageBitmap> {
        self.bitmap.as_mut().ok_or_else(|| {
            WireFsError::InvalidFilesystem("page bitmap not loaded".to_string())
        })
    }

    /// Read the usage bitmap kept by write-once devices, as one global image
    pub fn read_engine_bitmap(&mut self) -> Result<Vec<u8>> {
        let mut image = vec![0xFFu8; PageBitmap::byte_len(self.total_pages)];
        let banks = self.banks.clone();
        for bank in &banks {
            let mut local = vec![0u8; PageBitmap::byte_len(bank.page_count)];
            self.bank_mut(bank).read_page_bitmap(&mut local)?;
            for page in 0..bank.page_count {
                let free = local[page / 8] & (1 << (page % 8)) != 0;
                let global = bank.first_page + page;
                if !free {
                    image[global / 8] &= !(1 << (global % 8));
                }
            }
        }
        Ok(image)
    }

    fn read_bitmap_file(
        &mut self,
        layout: FsLayout,
        start: PageId,
        pages: usize,
    ) -> Result<(Vec<u8>, Vec<PageId>)> {
        let want = PageBitmap::byte_len(self.total_pages);
        let n = layout.pointer_len();
        let mut image = Vec::with_capacity(want);
        let mut chain = Vec::with_capacity(pages);
        let mut page = start;
        let mut guard = ChainGuard::new(ChainKind::Link, start, self.total_pages);
        for index in 0..pages {
            let data = self.read_page_packet(page)?;
            chain.push(page);
            if data.len() < n {
                return Err(WireFsError::InvalidFilesystem(format!(
                    "bitmap file page {} too short",
                    page
                )));
            }
            let (bits, next) = data.split_at(data.len() - n);
            image.extend_from_slice(bits);
            let next = layout.width.read(next);
            if next == 0 {
                if index + 1 != pages {
                    return Err(WireFsError::InvalidFilesystem(
                        "bitmap file shorter than recorded".to_string(),
                    ));
                }
                break;
            }
            page = guard.hop(PageId(next))?;
        }
        if image.len() < want {
            return Err(WireFsError::InvalidFilesystem(
                "bitmap file does not cover every page".to_string(),
            ));
        }
        image.truncate(want);
        Ok((image, chain))
    }

    /// Allocate a free page and mark it used
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let bitmap = self.bitmap_mut()?;
        let page = bitmap
            .next_free_page()
            .or_else(|| bitmap.first_free_page())
            .ok_or(WireFsError::OutOfSpace)?;
        bitmap.mark_used(page)?;
        debug!("Allocated page {}", page);
        Ok(page)
    }

    /// Claim a specific page in the bitmap
    pub fn mark_used(&mut self, page: PageId) -> Result<()> {
        self.bitmap_mut()?.mark_used(page)
    }

    /// Release a page; false when the medium cannot take it back
    pub fn free_page(&mut self, page: PageId) -> bool {
        match self.bitmap.as_mut() {
            Some(bitmap) => bitmap.free_page(page),
            None => false,
        }
    }

    /// Free pages left in the bitmap, 0 before one is loaded
    pub fn number_free_pages(&self) -> usize {
        self.bitmap
            .as_ref()
            .map(|b| b.number_free_pages())
            .unwrap_or(0)
    }

    // ---- reads --------------------------------------------------------------

    /// Validated packet data of `page`
    pub fn read_page_packet(&mut self, page: PageId) -> Result<Vec<u8>> {
        if page.index() >= self.total_pages {
            return Err(WireFsError::PageOutOfRange {
                page: page.index(),
                total: self.total_pages,
            });
        }
        if self.write_once {
            self.read_write_once(page)
        } else {
            self.read_rewritable(page)
        }
    }

    fn read_write_once(&mut self, start: PageId) -> Result<Vec<u8>> {
        let mut guard = ChainGuard::new(ChainKind::Redirect, start, self.total_pages);
        let mut page = start;
        loop {
            let slot = &self.slots[page.index()];
            if slot.redirect != 0 {
                page = guard.hop(PageId(slot.redirect))?;
                continue;
            }
            if slot.state.is_trusted() {
                return Ok(slot.data().to_vec());
            }

            let bank = self.bank_of(page)?.clone();
            let local = bank.local(page);
            let continuing = self.continuing(page, &bank);
            let mut raw = vec![0u8; bank.page_length];
            let mut extra = vec![0u8; bank.extra_info_length];
            self.bank_mut(&bank)
                .read_page_crc(local, continuing, &mut raw, &mut extra)?;
            self.stats.page_reads += 1;
            self.last_read = Some(page);

            let redirect = if bank.extra_info && !extra.is_empty() {
                (!extra[0]) as usize
            } else {
                self.bank_mut(&bank).redirected_page(local)?
            };
            if redirect != 0 {
                let target = self.redirect_target(&bank, page, redirect)?;
                self.slots[page.index()].redirect = target.0;
                page = guard.hop(target)?;
                continue;
            }

            let data = decode_packet(&raw, local)
                .map_err(|e| e.into_error(page))?
                .to_vec();
            let slot = &mut self.slots[page.index()];
            slot.content = raw;
            slot.packet_len = data.len();
            slot.state = PageState::ReadWithCrc;
            return Ok(data);
        }
    }

    fn redirect_target(&self, bank: &BankRef, page: PageId, local_target: usize) -> Result<PageId> {
        if local_target >= bank.page_count {
            return Err(WireFsError::PageOutOfRange {
                page: page.index(),
                total: self.total_pages,
            });
        }
        Ok(bank.global(local_target))
    }

    fn read_rewritable(&mut self, page: PageId) -> Result<Vec<u8>> {
        let slot = &self.slots[page.index()];
        if slot.state.is_trusted() {
            return Ok(slot.data().to_vec());
        }

        let bank = self.bank_of(page)?.clone();
        let local = bank.local(page);
        let mut last_error = None;
        for attempt in 0..self.config.read_retries {
            let continuing = attempt == 0 && self.continuing(page, &bank);
            let mut raw = vec![0u8; bank.page_length];
            self.bank_mut(&bank).read_page(local, continuing, &mut raw)?;
            self.stats.page_reads += 1;
            self.last_read = Some(page);

            // Unvalidated bytes stay in the slot so the next attempt can
            // compare against them.
            let slot = &mut self.slots[page.index()];
            let repeated = slot.state == PageState::ReadNoCrc && slot.content == raw;
            slot.content = raw;
            slot.state = PageState::ReadNoCrc;

            match decode_packet(&slot.content, local).map(|d| d.to_vec()) {
                Ok(data) => {
                    slot.packet_len = data.len();
                    slot.state = PageState::ReadWithCrc;
                    return Ok(data);
                }
                Err(e) => {
                    if repeated {
                        // Same bytes twice: the page itself is bad.
                        return Err(e.into_error(page));
                    }
                    if attempt > 0 {
                        self.stats.read_retries += 1;
                    }
                    warn!("Page {} failed packet check ({:?}), retrying", page, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .map(|e| e.into_error(page))
            .unwrap_or(WireFsError::CrcMismatch { page: page.index() }))
    }

    /// Current device content of `page`, bypassing the cache
    fn read_physical(&mut self, bank: &BankRef, page: PageId) -> Result<Vec<u8>> {
        let local = bank.local(page);
        let mut raw = vec![0u8; bank.page_length];
        let mut extra = vec![0u8; bank.extra_info_length];
        if bank.write_once {
            self.bank_mut(bank)
                .read_page_crc(local, false, &mut raw, &mut extra)?;
        } else {
            self.bank_mut(bank).read_page(local, false, &mut raw)?;
        }
        self.stats.page_reads += 1;
        self.last_read = Some(page);
        Ok(raw)
    }

    /// Live redirect of `page` as reported by the device
    fn lookup_redirect(&mut self, bank: &BankRef, page: PageId) -> Result<usize> {
        let local = bank.local(page);
        match self.bank_mut(bank).redirected_page(local) {
            Ok(target) => Ok(target),
            Err(TransportError::Unsupported(_)) if bank.extra_info => {
                let mut raw = vec![0u8; bank.page_length];
                let mut extra = vec![0u8; bank.extra_info_length.max(1)];
                self.bank_mut(bank)
                    .read_page_crc(local, false, &mut raw, &mut extra)?;
                Ok((!extra[0]) as usize)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- writes -------------------------------------------------------------

    /// Stage `data` as the new packet of `page`
    pub fn write_page_packet(&mut self, page: PageId, data: &[u8]) -> Result<()> {
        let bank = self.bank_of(page)?.clone();
        if data.len() > bank.max_data_length() {
            return Err(WireFsError::InvalidPacketLength {
                page: page.index(),
                length: data.len(),
            });
        }

        if self.write_once {
            let target = self.terminal_page(&bank, page)?;
            let packet = encode_packet(data, bank.local(target));
            let slot = &mut self.slots[target.index()];
            slot.stage(&packet, 0xFF);
            slot.state = PageState::Verify;
            self.write_log.push(target);
        } else {
            let packet = encode_packet(data, bank.local(page));
            let slot = &mut self.slots[page.index()];
            slot.stage(&packet, 0x00);
            slot.state = PageState::Write;
            self.write_log.push(page);
        }
        Ok(())
    }

    /// Follow the redirect chain of `page` to the page that holds its content.
    /// Materialized redirects of clean pages are refreshed from the device.
    fn terminal_page(&mut self, bank: &BankRef, page: PageId) -> Result<PageId> {
        let mut guard = ChainGuard::new(ChainKind::Redirect, page, self.total_pages);
        let mut current = page;
        loop {
            let slot = &self.slots[current.index()];
            let next = if slot.state.is_dirty() {
                slot.redirect as usize
            } else {
                let cached = slot.redirect;
                let live = self.lookup_redirect(bank, current)?;
                let live = if live == 0 {
                    0
                } else {
                    self.redirect_target(bank, current, live)?.0
                };
                if live != cached {
                    if cached != 0 {
                        warn!(
                            "Stale redirect on page {} ({} -> {}), refreshing",
                            current, cached, live
                        );
                    }
                    let slot = &mut self.slots[current.index()];
                    slot.redirect = live;
                    if slot.state == PageState::ReadWithCrc {
                        slot.state = PageState::NotRead;
                    }
                }
                live as usize
            };
            if next == 0 {
                return Ok(current);
            }
            current = guard.hop(PageId::from_index(next))?;
        }
    }

    /// Drop every staged write and uncommitted bitmap change
    pub fn discard_pending(&mut self) {
        for page in self.write_log.oldest_first() {
            let slot = &mut self.slots[page.index()];
            if slot.state == PageState::Redirect {
                slot.redirect = 0;
            }
            slot.state = PageState::NotRead;
        }
        if !self.write_log.is_empty() {
            warn!("Discarding {} unflushed pages", self.write_log.len());
        }
        self.write_log.clear();
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.discard_changes();
        }
    }

    /// Forget every cached page (the device content changed underneath)
    pub fn invalidate(&mut self) {
        self.discard_pending();
        for slot in &mut self.slots {
            slot.state = PageState::NotRead;
            slot.redirect = 0;
        }
        self.last_read = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn cache_over(devices: Vec<SimDevice>) -> MemoryCache {
        let boxed = devices
            .into_iter()
            .map(|d| Box::new(d) as Box<dyn Device>)
            .collect();
        MemoryCache::new(boxed, WireFsConfig::default()).unwrap()
    }

    #[test]
    fn test_global_page_numbering() {
        let cache = cache_over(vec![
            SimDevice::rewritable(DeviceAddress(1), 10, 32),
            SimDevice::rewritable(DeviceAddress(2), 20, 32),
        ]);
        assert_eq!(cache.total_pages(), 30);
        assert_eq!(cache.bank_of(PageId(9)).unwrap().device, 0);
        assert_eq!(cache.bank_of(PageId(10)).unwrap().device, 1);
        assert_eq!(cache.bank_of(PageId(10)).unwrap().local(PageId(10)), 0);
        assert_eq!(cache.device_first_page(1), Some(PageId(10)));
        assert!(cache.bank_of(PageId(30)).is_err());
    }

    #[test]
    fn test_rejects_mixed_media() {
        let devices: Vec<Box<dyn Device>> = vec![
            Box::new(SimDevice::rewritable(DeviceAddress(1), 10, 32)),
            Box::new(SimDevice::write_once(DeviceAddress(2), 10, 32)),
        ];
        assert!(matches!(
            MemoryCache::new(devices, WireFsConfig::default()),
            Err(WireFsError::InvalidFilesystem(_))
        ));
    }

    #[test]
    fn test_write_is_buffered_until_sync() {
        let device = SimDevice::rewritable(DeviceAddress(1), 10, 32);
        let mut cache = cache_over(vec![device.clone()]);
        cache.write_page_packet(PageId(2), b"abc").unwrap();
        assert_eq!(device.page_write_count(2), 0);
        assert_eq!(cache.page_state(PageId(2)), Some(PageState::Write));
        assert_eq!(cache.read_page_packet(PageId(2)).unwrap(), b"abc");

        cache.sync().unwrap();
        assert_eq!(device.page_write_count(2), 1);
        assert_eq!(cache.page_state(PageId(2)), Some(PageState::ReadWithCrc));
        assert!(cache.write_log().is_empty());
    }

    #[test]
    fn test_rejects_oversized_packet() {
        let mut cache = cache_over(vec![SimDevice::rewritable(DeviceAddress(1), 4, 32)]);
        let err = cache.write_page_packet(PageId(1), &[0u8; 30]).unwrap_err();
        assert!(matches!(
            err,
            WireFsError::InvalidPacketLength { page: 1, length: 30 }
        ));
        assert!(cache.write_page_packet(PageId(1), &[0u8; 29]).is_ok());
    }

    #[test]
    fn test_long_pages_cap_packet_at_length_byte() {
        let device = SimDevice::rewritable(DeviceAddress(1), 4, 300);
        let mut cache = cache_over(vec![device.clone()]);
        assert_eq!(cache.max_data_length(PageId(1)).unwrap(), 255);
        assert!(matches!(
            cache.write_page_packet(PageId(1), &[0x5A; 290]),
            Err(WireFsError::InvalidPacketLength { page: 1, length: 290 })
        ));

        cache.write_page_packet(PageId(1), &[0x5A; 255]).unwrap();
        cache.sync().unwrap();
        let mut fresh = cache_over(vec![device]);
        assert_eq!(fresh.read_page_packet(PageId(1)).unwrap(), vec![0x5A; 255]);
    }

    #[test]
    fn test_failed_read_leaves_unvalidated_slot() {
        let device = SimDevice::rewritable(DeviceAddress(1), 4, 32);
        let mut cache = cache_over(vec![device.clone()]);
        cache.write_page_packet(PageId(1), b"stable").unwrap();
        cache.sync().unwrap();
        device.poke(1, 2, 0x00);

        let mut fresh = cache_over(vec![device.clone()]);
        assert!(fresh.read_page_packet(PageId(1)).is_err());
        assert_eq!(fresh.page_state(PageId(1)), Some(PageState::ReadNoCrc));
        assert!(fresh.write_log().is_empty());

        // A rewrite on the device heals the page on the next read.
        let mut writer = cache_over(vec![device]);
        writer.write_page_packet(PageId(1), b"healed").unwrap();
        writer.sync().unwrap();
        assert_eq!(fresh.read_page_packet(PageId(1)).unwrap(), b"healed");
        assert_eq!(fresh.page_state(PageId(1)), Some(PageState::ReadWithCrc));
    }

    #[test]
    fn test_transient_corruption_is_retried() {
        let device = SimDevice::rewritable(DeviceAddress(1), 4, 32);
        let mut cache = cache_over(vec![device.clone()]);
        cache.write_page_packet(PageId(1), b"stable").unwrap();
        cache.sync().unwrap();

        let mut fresh = cache_over(vec![device.clone()]);
        device.corrupt_next_reads(2);
        assert_eq!(fresh.read_page_packet(PageId(1)).unwrap(), b"stable");
        assert!(fresh.stats().page_reads >= 3);
    }

    #[test]
    fn test_persistent_corruption_is_reported() {
        let device = SimDevice::rewritable(DeviceAddress(1), 4, 32);
        let mut cache = cache_over(vec![device.clone()]);
        cache.write_page_packet(PageId(1), b"stable").unwrap();
        cache.sync().unwrap();
        device.poke(1, 2, 0x00);

        let mut fresh = cache_over(vec![device]);
        let err = fresh.read_page_packet(PageId(1)).unwrap_err();
        assert!(matches!(err, WireFsError::CrcMismatch { page: 1 }));
        assert_eq!(fresh.stats().page_reads, 2);
    }

    #[test]
    fn test_write_once_staging_marks_verify() {
        let device = SimDevice::write_once(DeviceAddress(1), 8, 32);
        let mut cache = cache_over(vec![device]);
        cache.write_page_packet(PageId(3), b"otp").unwrap();
        assert_eq!(cache.page_state(PageId(3)), Some(PageState::Verify));
        assert_eq!(cache.read_page_packet(PageId(3)).unwrap(), b"otp");
    }

    #[test]
    fn test_owner_set() {
        let mut cache = cache_over(vec![SimDevice::rewritable(DeviceAddress(1), 4, 32)]);
        cache.add_owner(OwnerId(1));
        cache.add_owner(OwnerId(2));
        assert!(!cache.remove_owner(OwnerId(1)));
        assert!(cache.remove_owner(OwnerId(2)));
    }

    #[test]
    fn test_single_writer_per_path() {
        let mut cache = cache_over(vec![SimDevice::rewritable(DeviceAddress(1), 4, 32)]);
        cache.claim_writer("/A.1").unwrap();
        assert!(matches!(
            cache.claim_writer("/A.1"),
            Err(WireFsError::AlreadyOpenForWrite { .. })
        ));
        cache.release_writer("/A.1");
        assert!(cache.claim_writer("/A.1").is_ok());
    }
}
