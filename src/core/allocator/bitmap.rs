//! Page usage bitmap with committed and modified images
//!
//! The committed image matches what is physically stored; the modified image
//! is the desired state. On write-once media a set bit means free and a page
//! can only move from free to used, so the image programmed on flush is
//! `committed & !(committed ^ modified)`.

use crate::core::allocator::PageAllocator;
use crate::core::error::{Result, WireFsError};
use crate::core::page::PageId;
use std::ops::Range;

/// Bitmap over every page of one filesystem
#[derive(Debug, Clone)]
pub struct PageBitmap {
    /// Image matching the device
    committed: Vec<u8>,

    /// Desired image
    modified: Vec<u8>,

    /// Number of pages tracked
    total_pages: usize,

    /// Write-once polarity: 1 = free, 0 = used
    write_once: bool,

    /// Scan position (last returned page)
    cursor: usize,
}

impl PageBitmap {
    /// Bitmap with every page free
    pub fn new(total_pages: usize, write_once: bool) -> Self {
        let fill = if write_once { 0xFF } else { 0x00 };
        let image = vec![fill; Self::byte_len(total_pages)];
        Self::from_image(image, total_pages, write_once)
    }

    /// Bitmap loaded from a stored image
    pub fn from_image(mut image: Vec<u8>, total_pages: usize, write_once: bool) -> Self {
        image.resize(Self::byte_len(total_pages), if write_once { 0xFF } else { 0x00 });
        PageBitmap {
            modified: image.clone(),
            committed: image,
            total_pages,
            write_once,
            cursor: 0,
        }
    }

    /// Bytes needed to hold one bit per page
    pub fn byte_len(total_pages: usize) -> usize {
        (total_pages + 7) / 8
    }

    fn bit(image: &[u8], page: usize) -> bool {
        image[page / 8] & (1 << (page % 8)) != 0
    }

    fn set_bit(image: &mut [u8], page: usize, value: bool) {
        if value {
            image[page / 8] |= 1 << (page % 8);
        } else {
            image[page / 8] &= !(1 << (page % 8));
        }
    }

    fn used_in(&self, image: &[u8], page: usize) -> bool {
        Self::bit(image, page) != self.write_once
    }

    /// Page is used in the desired image
    pub fn is_used(&self, page: PageId) -> bool {
        page.index() < self.total_pages && self.used_in(&self.modified, page.index())
    }

    /// Page is used in the committed image
    pub fn is_committed_used(&self, page: PageId) -> bool {
        page.index() < self.total_pages && self.used_in(&self.committed, page.index())
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn is_write_once(&self) -> bool {
        self.write_once
    }

    /// Desired image differs from the committed one
    pub fn is_dirty(&self) -> bool {
        self.modified != self.committed
    }

    pub fn modified_image(&self) -> &[u8] {
        &self.modified
    }

    pub fn committed_image(&self) -> &[u8] {
        &self.committed
    }

    /// Image to physically store on flush
    pub fn program_image(&self) -> Vec<u8> {
        if self.write_once {
            self.committed
                .iter()
                .zip(&self.modified)
                .map(|(&c, &m)| c & !(c ^ m))
                .collect()
        } else {
            self.modified.clone()
        }
    }

    /// Record that `image` is now physically stored
    pub fn commit(&mut self, image: Vec<u8>) {
        self.modified = image.clone();
        self.committed = image;
    }

    /// Forget uncommitted changes
    pub fn discard_changes(&mut self) {
        self.modified = self.committed.clone();
    }

    /// First free page inside `range` without moving the scan cursor
    pub fn free_page_in(&self, range: Range<usize>) -> Option<PageId> {
        let end = range.end.min(self.total_pages);
        (range.start..end)
            .find(|&page| !self.used_in(&self.modified, page))
            .map(PageId::from_index)
    }

    fn scan_from(&mut self, start: usize) -> Option<PageId> {
        let found = self.free_page_in(start..self.total_pages)?;
        self.cursor = found.index();
        Some(found)
    }
}

impl PageAllocator for PageBitmap {
    fn mark_used(&mut self, page: PageId) -> Result<()> {
        if page.index() >= self.total_pages {
            return Err(WireFsError::PageOutOfRange {
                page: page.index(),
                total: self.total_pages,
            });
        }
        let value = !self.write_once;
        Self::set_bit(&mut self.modified, page.index(), value);
        Ok(())
    }

    fn free_page(&mut self, page: PageId) -> bool {
        let index = page.index();
        if index >= self.total_pages || !self.used_in(&self.modified, index) {
            return false;
        }
        if self.write_once && self.used_in(&self.committed, index) {
            // Programmed bits stay programmed.
            return false;
        }
        let value = self.write_once;
        Self::set_bit(&mut self.modified, index, value);
        true
    }

    fn first_free_page(&mut self) -> Option<PageId> {
        self.cursor = 0;
        self.scan_from(0)
    }

    fn next_free_page(&mut self) -> Option<PageId> {
        self.scan_from(self.cursor)
    }

    fn number_free_pages(&self) -> usize {
        (0..self.total_pages)
            .filter(|&page| !self.used_in(&self.modified, page))
            .count()
    }
}
