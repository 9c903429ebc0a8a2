//! Page allocation for the filesystem
//!
//! Every filesystem tracks page usage with one bitmap. Where that bitmap
//! lives is fixed when the filesystem is opened:
//! - [`BitmapPlacement::Engine`]: the device keeps it (write-once parts), the
//!   page cache reads and programs it
//! - [`BitmapPlacement::Local`]: 4 bytes inside the root directory control
//!   field, for filesystems of at most 32 pages
//! - [`BitmapPlacement::File`]: a chain of bitmap pages elsewhere in the
//!   address space

pub mod bitmap;

use crate::core::error::Result;
use crate::core::page::PageId;

pub use bitmap::PageBitmap;

/// Largest filesystem whose bitmap fits in the root control field
pub const LOCAL_BITMAP_PAGES: usize = 32;

/// Bytes of the root control field used by a local bitmap
pub const LOCAL_BITMAP_BYTES: usize = LOCAL_BITMAP_PAGES / 8;

/// Where the page bitmap of a filesystem is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapPlacement {
    Engine,
    Local,
    File { start: PageId, pages: usize },
}

impl BitmapPlacement {
    /// Pick the placement for a freshly formatted filesystem
    pub fn select(
        device_tracks_usage: bool,
        total_pages: usize,
        bitmap_file_start: PageId,
        bitmap_file_pages: usize,
    ) -> Self {
        if device_tracks_usage {
            BitmapPlacement::Engine
        } else if total_pages <= LOCAL_BITMAP_PAGES {
            BitmapPlacement::Local
        } else {
            BitmapPlacement::File {
                start: bitmap_file_start,
                pages: bitmap_file_pages,
            }
        }
    }
}

/// Page allocator contract shared by all bitmap placements
pub trait PageAllocator {
    /// Mark `page` as used
    fn mark_used(&mut self, page: PageId) -> Result<()>;

    /// Release `page`; false when the page cannot be (or was not) released
    fn free_page(&mut self, page: PageId) -> bool;

    /// Restart scanning at page 0 and return the first free page
    fn first_free_page(&mut self) -> Option<PageId>;

    /// Continue scanning from the last returned page
    fn next_free_page(&mut self) -> Option<PageId>;

    /// Number of free pages
    fn number_free_pages(&self) -> usize;
}
