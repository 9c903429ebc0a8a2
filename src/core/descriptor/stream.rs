//! File page chains and the sequential cursor
//!
//! A file page's packet data is the payload followed by the next-page
//! pointer. Writes only ever extend the last page of the chain.

use crate::core::cache::MemoryCache;
use crate::core::error::{Result, WireFsError};
use crate::core::header::FsLayout;
use crate::core::page::{ChainGuard, ChainKind, PageId};
use tracing::debug;

/// Payload and next pointer of one file page
pub fn read_file_page(cache: &mut MemoryCache, layout: FsLayout, page: PageId) -> Result<(Vec<u8>, u32)> {
    let mut data = cache.read_page_packet(page)?;
    let n = layout.pointer_len();
    if data.len() < n {
        return Err(WireFsError::InvalidFilesystem(format!(
            "file page {} lacks its next pointer",
            page
        )));
    }
    let next = layout.width.read(&data[data.len() - n..]);
    data.truncate(data.len() - n);
    Ok((data, next))
}

pub fn write_file_page(
    cache: &mut MemoryCache,
    layout: FsLayout,
    page: PageId,
    payload: &[u8],
    next: u32,
) -> Result<()> {
    let mut data = payload.to_vec();
    data.extend(layout.width.encode(next));
    cache.write_page_packet(page, &data)
}

/// Payload bytes a file page can hold
pub fn payload_capacity(cache: &MemoryCache, layout: FsLayout, page: PageId) -> Result<usize> {
    Ok(cache.max_data_length(page)?.saturating_sub(layout.pointer_len()))
}

/// Allocate the first page of an empty file
pub fn create_file_page(cache: &mut MemoryCache, layout: FsLayout) -> Result<PageId> {
    let page = cache.allocate_page()?;
    write_file_page(cache, layout, page, &[], 0)?;
    Ok(page)
}

/// Pages of the chain starting at `start`, in order
pub fn chain_pages(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<Vec<PageId>> {
    let mut guard = ChainGuard::new(ChainKind::Link, start, cache.total_pages());
    let mut pages = vec![start];
    let mut page = start;
    loop {
        let (_, next) = read_file_page(cache, layout, page)?;
        if next == 0 {
            return Ok(pages);
        }
        page = guard.hop(PageId(next))?;
        pages.push(page);
    }
}

/// Total payload bytes of the chain starting at `start`
pub fn chain_length(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<u64> {
    let mut guard = ChainGuard::new(ChainKind::Link, start, cache.total_pages());
    let mut length = 0u64;
    let mut page = start;
    loop {
        let (payload, next) = read_file_page(cache, layout, page)?;
        length += payload.len() as u64;
        if next == 0 {
            return Ok(length);
        }
        page = guard.hop(PageId(next))?;
    }
}

/// Release every page of the chain starting at `start`
pub fn free_chain(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<usize> {
    let pages = chain_pages(cache, layout, start)?;
    let freed = pages.iter().filter(|&&page| cache.free_page(page)).count();
    Ok(freed)
}

/// Cut the chain back to an empty first page
pub fn truncate(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<()> {
    let pages = chain_pages(cache, layout, start)?;
    for &page in &pages[1..] {
        cache.free_page(page);
    }
    write_file_page(cache, layout, start, &[], 0)?;
    if pages.len() > 1 {
        debug!("Truncated file at page {}, released {} pages", start, pages.len() - 1);
    }
    Ok(())
}

/// Position inside a file chain
#[derive(Debug, Clone)]
pub struct Cursor {
    start: PageId,
    page: PageId,
    offset: usize,
    position: u64,
    hops: usize,
    /// Pages linked by writes and not yet reported
    added: u32,
}

impl Cursor {
    pub fn new(start: PageId) -> Self {
        Cursor {
            start,
            page: start,
            offset: 0,
            position: 0,
            hops: 0,
            added: 0,
        }
    }

    /// Absolute position in the file
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    fn advance(&mut self, next: u32, total_pages: usize) -> Result<()> {
        self.hops += 1;
        if self.hops >= total_pages {
            return Err(WireFsError::ChainLoop {
                page: self.start.index(),
            });
        }
        self.page = PageId(next);
        self.offset = 0;
        Ok(())
    }

    /// Read into `buf`; a short count means the end of the file was reached
    pub fn read(&mut self, cache: &mut MemoryCache, layout: FsLayout, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let (payload, next) = read_file_page(cache, layout, self.page)?;
            if self.offset < payload.len() {
                let count = (payload.len() - self.offset).min(buf.len() - done);
                buf[done..done + count].copy_from_slice(&payload[self.offset..self.offset + count]);
                self.offset += count;
                self.position += count as u64;
                done += count;
                continue;
            }
            if next == 0 {
                break;
            }
            self.advance(next, cache.total_pages())?;
        }
        Ok(done)
    }

    /// Move forward by up to `count` bytes, returning how far it got
    pub fn skip(&mut self, cache: &mut MemoryCache, layout: FsLayout, count: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < count {
            let (payload, next) = read_file_page(cache, layout, self.page)?;
            let available = (payload.len() - self.offset.min(payload.len())) as u64;
            if available > 0 {
                let step = available.min(count - skipped);
                self.offset += step as usize;
                self.position += step;
                skipped += step;
                continue;
            }
            if next == 0 {
                break;
            }
            self.advance(next, cache.total_pages())?;
        }
        Ok(skipped)
    }

    /// Move to the end of the file
    pub fn seek_end(&mut self, cache: &mut MemoryCache, layout: FsLayout) -> Result<()> {
        self.skip(cache, layout, u64::MAX).map(|_| ())
    }

    /// Pages linked to the chain since the last call
    pub fn take_added(&mut self) -> u32 {
        std::mem::take(&mut self.added)
    }

    /// Append `data` at the cursor, which must sit at the end of the file.
    /// Pages linked on the way are counted even when the write fails later.
    pub fn write(&mut self, cache: &mut MemoryCache, layout: FsLayout, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let (mut payload, next) = read_file_page(cache, layout, self.page)?;
            if next != 0 || self.offset < payload.len() {
                self.seek_end(cache, layout)?;
                continue;
            }
            let room = payload_capacity(cache, layout, self.page)?.saturating_sub(payload.len());

            if room == 0 {
                let page = cache.allocate_page()?;
                write_file_page(cache, layout, page, &[], 0)?;
                write_file_page(cache, layout, self.page, &payload, page.0)?;
                self.added += 1;
                self.advance(page.0, cache.total_pages())?;
                continue;
            }

            let count = room.min(rest.len());
            payload.extend_from_slice(&rest[..count]);
            write_file_page(cache, layout, self.page, &payload, 0)?;
            self.offset += count;
            self.position += count as u64;
            rest = &rest[count..];
        }
        Ok(())
    }
}
