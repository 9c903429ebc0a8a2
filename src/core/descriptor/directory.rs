//! Directory page chains
//!
//! A directory is a chain of pages. The first page starts with the control
//! field, every page holds packed entry records and ends with the next-page
//! pointer.

use crate::core::cache::MemoryCache;
use crate::core::error::{Result, WireFsError};
use crate::core::header::{subdirectory_control, FsLayout, CONTROL_LEN};
use crate::core::page::{ChainGuard, ChainKind, PageId};
use crate::core::record::{EntryName, EntryRecord};
use tracing::debug;

/// One decoded directory page
#[derive(Debug, Clone)]
pub struct DirPage {
    pub page: PageId,
    /// Control field, first page of a directory only
    pub control: Option<Vec<u8>>,
    pub records: Vec<EntryRecord>,
    pub next: u32,
}

/// An entry together with where it is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub record: EntryRecord,
    /// First page of the directory holding the entry
    pub dir: PageId,
    pub page: PageId,
    pub index: usize,
}

impl DirEntry {
    fn on_first_page(&self) -> bool {
        self.page == self.dir
    }
}

fn header_len(first: bool) -> usize {
    if first {
        CONTROL_LEN
    } else {
        0
    }
}

/// Number of records a directory page can hold
pub fn page_capacity(cache: &MemoryCache, layout: FsLayout, page: PageId, first: bool) -> Result<usize> {
    let room = cache
        .max_data_length(page)?
        .saturating_sub(layout.pointer_len() + header_len(first));
    Ok(room / layout.entry_len())
}

pub fn read_dir_page(
    cache: &mut MemoryCache,
    layout: FsLayout,
    page: PageId,
    first: bool,
) -> Result<DirPage> {
    let data = cache.read_page_packet(page)?;
    let n = layout.pointer_len();
    let header = header_len(first);
    if data.len() < header + n || (data.len() - header - n) % layout.entry_len() != 0 {
        return Err(WireFsError::InvalidFilesystem(format!(
            "malformed directory page {} ({} bytes)",
            page,
            data.len()
        )));
    }
    let body = &data[header..data.len() - n];
    let records = body
        .chunks(layout.entry_len())
        .map(|chunk| EntryRecord::decode(chunk, layout.width))
        .collect::<Result<Vec<_>>>()?;
    Ok(DirPage {
        page,
        control: first.then(|| data[..header].to_vec()),
        records,
        next: layout.width.read(&data[data.len() - n..]),
    })
}

pub fn write_dir_page(cache: &mut MemoryCache, layout: FsLayout, dir: &DirPage) -> Result<()> {
    let mut data = dir.control.clone().unwrap_or_default();
    for record in &dir.records {
        data.extend(record.encode(layout.width));
    }
    data.extend(layout.width.encode(dir.next));
    cache.write_page_packet(dir.page, &data)
}

/// Every page of the directory starting at `start`
pub fn load_chain(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<Vec<DirPage>> {
    let mut guard = ChainGuard::new(ChainKind::Link, start, cache.total_pages());
    let mut pages = Vec::new();
    let mut page = start;
    loop {
        let dir = read_dir_page(cache, layout, page, pages.is_empty())?;
        let next = dir.next;
        pages.push(dir);
        if next == 0 {
            return Ok(pages);
        }
        page = guard.hop(PageId(next))?;
    }
}

/// Look up `name` in the directory starting at `start`
pub fn find(
    cache: &mut MemoryCache,
    layout: FsLayout,
    start: PageId,
    name: &EntryName,
) -> Result<Option<DirEntry>> {
    let mut guard = ChainGuard::new(ChainKind::Link, start, cache.total_pages());
    let mut page = start;
    let mut first = true;
    loop {
        let dir = read_dir_page(cache, layout, page, first)?;
        if let Some(index) = dir.records.iter().position(|r| name.matches(&r.name)) {
            return Ok(Some(DirEntry {
                record: dir.records[index],
                dir: start,
                page,
                index,
            }));
        }
        if dir.next == 0 {
            return Ok(None);
        }
        page = guard.hop(PageId(dir.next))?;
        first = false;
    }
}

pub fn list(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<Vec<DirEntry>> {
    let chain = load_chain(cache, layout, start)?;
    Ok(chain
        .iter()
        .flat_map(|dir| {
            dir.records.iter().enumerate().map(move |(index, record)| DirEntry {
                record: *record,
                dir: start,
                page: dir.page,
                index,
            })
        })
        .collect())
}

/// The last page of the directory has no room for another record
pub fn is_full(cache: &mut MemoryCache, layout: FsLayout, start: PageId) -> Result<bool> {
    let chain = load_chain(cache, layout, start)?;
    let first = chain.len() == 1;
    match chain.last() {
        Some(last) => Ok(last.records.len() >= page_capacity(cache, layout, last.page, first)?),
        None => Ok(true),
    }
}

/// Append `record`, linking a new directory page when the last one is full
pub fn append(
    cache: &mut MemoryCache,
    layout: FsLayout,
    start: PageId,
    record: EntryRecord,
) -> Result<DirEntry> {
    let mut chain = load_chain(cache, layout, start)?;
    let first = chain.len() == 1;
    let Some(last) = chain.last_mut() else {
        return Err(WireFsError::InvalidFilesystem("empty directory chain".to_string()));
    };

    if last.records.len() < page_capacity(cache, layout, last.page, first)? {
        last.records.push(record);
        write_dir_page(cache, layout, last)?;
        return Ok(DirEntry {
            record,
            dir: start,
            page: last.page,
            index: last.records.len() - 1,
        });
    }

    let page = cache.allocate_page()?;
    let continuation = DirPage {
        page,
        control: None,
        records: vec![record],
        next: 0,
    };
    write_dir_page(cache, layout, &continuation)?;
    last.next = page.0;
    write_dir_page(cache, layout, last)?;
    debug!("Directory {} extended with page {}", start, page);
    Ok(DirEntry {
        record,
        dir: start,
        page,
        index: 0,
    })
}

/// Remove `entry` from its directory. A continuation page left empty is
/// unlinked and released.
pub fn excise(cache: &mut MemoryCache, layout: FsLayout, entry: &DirEntry) -> Result<()> {
    let start = entry.dir;
    let mut chain = load_chain(cache, layout, start)?;
    let pos = chain
        .iter()
        .position(|dir| dir.page == entry.page)
        .ok_or_else(|| stale_entry(entry))?;
    if chain[pos].records.get(entry.index) != Some(&entry.record) {
        return Err(stale_entry(entry));
    }
    chain[pos].records.remove(entry.index);

    if pos > 0 && chain[pos].records.is_empty() {
        let next = chain[pos].next;
        let page = chain[pos].page;
        chain[pos - 1].next = next;
        write_dir_page(cache, layout, &chain[pos - 1])?;
        cache.free_page(page);
        debug!("Directory {} released empty page {}", start, page);
    } else {
        write_dir_page(cache, layout, &chain[pos])?;
    }
    Ok(())
}

/// Rewrite the record stored at `entry`
pub fn update(cache: &mut MemoryCache, layout: FsLayout, entry: &DirEntry, record: EntryRecord) -> Result<()> {
    let mut dir = read_dir_page(cache, layout, entry.page, entry.on_first_page())?;
    match dir.records.get_mut(entry.index) {
        Some(slot) if *slot == entry.record => *slot = record,
        _ => return Err(stale_entry(entry)),
    }
    write_dir_page(cache, layout, &dir)
}

fn stale_entry(entry: &DirEntry) -> WireFsError {
    WireFsError::InvalidFilesystem(format!(
        "directory entry {} moved on page {}",
        entry.record.name, entry.page
    ))
}

/// Allocate and write the first page of a new, empty sub-directory
pub fn create_directory_page(cache: &mut MemoryCache, layout: FsLayout, parent: PageId) -> Result<PageId> {
    let page = cache.allocate_page()?;
    let dir = DirPage {
        page,
        control: Some(subdirectory_control(layout.width, parent).to_vec()),
        records: Vec::new(),
        next: 0,
    };
    write_dir_page(cache, layout, &dir)?;
    Ok(page)
}

/// Point the control field of the directory at `start` to a new parent
pub fn set_parent(cache: &mut MemoryCache, layout: FsLayout, start: PageId, parent: PageId) -> Result<()> {
    let mut dir = read_dir_page(cache, layout, start, true)?;
    dir.control = Some(subdirectory_control(layout.width, parent).to_vec());
    write_dir_page(cache, layout, &dir)
}
