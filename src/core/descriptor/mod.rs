//! Open descriptor on one path of a filesystem
//!
//! A [`FileDescriptor`] owns a parsed path and a handle on the shared cache
//! of its device group. Topology is resolved lazily on the first operation
//! that touches the filesystem.

pub mod directory;
pub mod format;
pub mod stream;

use crate::core::cache::{CacheStats, MemoryCache};
use crate::core::error::{Result, WireFsError};
use crate::core::header::FsLayout;
use crate::core::page::PageId;
use crate::core::path::FsPath;
use crate::core::provider::DeviceAddress;
use crate::core::record::{EntryKind, EntryRecord};
use crate::core::registry::{CacheHandle, CacheRegistry};
use crate::core::topology;
use directory::DirEntry;
use std::sync::Arc;
use stream::Cursor;
use tracing::{debug, warn};

/// Outcome of walking a path from the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Root,
    Found(DirEntry),
    /// `dir` is the deepest existing directory, `resolved` the number of
    /// leading components that exist
    Missing { dir: PageId, resolved: usize },
}

/// Walk `path` from the root directory
pub fn lookup(cache: &mut MemoryCache, layout: FsLayout, path: &FsPath) -> Result<Lookup> {
    let components = path.components();
    if components.is_empty() {
        return Ok(Lookup::Root);
    }
    let mut dir = PageId::ROOT;
    for (index, name) in components.iter().enumerate() {
        let Some(entry) = directory::find(cache, layout, dir, name)? else {
            return Ok(Lookup::Missing {
                dir,
                resolved: index,
            });
        };
        if index + 1 == components.len() {
            return Ok(Lookup::Found(entry));
        }
        if !entry.record.is_directory() {
            return Err(WireFsError::NotDirectory {
                path: path.to_string(),
            });
        }
        dir = entry.record.start;
    }
    Ok(Lookup::Root)
}

fn invalid(path: &FsPath, reason: &'static str) -> WireFsError {
    WireFsError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

/// Create every missing component of `path` below `dir`. Intermediate
/// components become directories; the last one takes its own type, an
/// untyped name becoming a directory.
fn create_missing(
    cache: &mut MemoryCache,
    layout: FsLayout,
    path: &FsPath,
    dir: PageId,
    resolved: usize,
) -> Result<DirEntry> {
    let missing = &path.components()[resolved..];
    if missing[..missing.len().saturating_sub(1)]
        .iter()
        .any(|name| name.kind().is_file())
    {
        return Err(WireFsError::NotDirectory {
            path: path.to_string(),
        });
    }

    let need = missing.len() + usize::from(directory::is_full(cache, layout, dir)?);
    if cache.number_free_pages() < need {
        return Err(WireFsError::OutOfSpace);
    }

    let mut parent = dir;
    let mut created = None;
    for name in missing {
        let kind = match name.kind() {
            EntryKind::Untyped => EntryKind::Directory,
            kind => kind,
        };
        let (start, pages) = if kind.is_directory() {
            (directory::create_directory_page(cache, layout, parent)?, 0)
        } else {
            (stream::create_file_page(cache, layout)?, 1)
        };
        let record = EntryRecord::new(name.with_kind(kind), start, pages);
        created = Some(directory::append(cache, layout, parent, record)?);
        parent = start;
    }
    debug!("Created {} ({} new entries)", path, missing.len());
    created.ok_or_else(|| invalid(path, "nothing to create"))
}

/// Create or truncate the file at `path` without checking writers
fn create_file_in(
    cache: &mut MemoryCache,
    layout: FsLayout,
    path: &FsPath,
    append: bool,
) -> Result<DirEntry> {
    match lookup(cache, layout, path)? {
        Lookup::Root => Err(WireFsError::NotFile {
            path: path.to_string(),
        }),
        Lookup::Found(entry) if entry.record.is_directory() => Err(WireFsError::NotFile {
            path: path.to_string(),
        }),
        Lookup::Found(entry) => {
            if append {
                return Ok(entry);
            }
            if entry.record.pages == 1
                && stream::chain_length(cache, layout, entry.record.start)? == 0
            {
                return Ok(entry);
            }
            stream::truncate(cache, layout, entry.record.start)?;
            let record = EntryRecord {
                pages: 1,
                ..entry.record
            };
            directory::update(cache, layout, &entry, record)?;
            Ok(DirEntry { record, ..entry })
        }
        Lookup::Missing { dir, resolved } => create_missing(cache, layout, path, dir, resolved),
    }
}

fn not_open(path: &FsPath, mode: &'static str) -> WireFsError {
    WireFsError::NotOpen {
        path: path.to_string(),
        mode,
    }
}

#[derive(Debug)]
enum OpenMode {
    Closed,
    Read(Cursor),
    Write(Cursor),
}

/// Handle on one path, sharing the page cache of its device group
pub struct FileDescriptor {
    registry: Arc<CacheRegistry>,
    handle: CacheHandle,
    path: FsPath,
    mode: OpenMode,
}

impl FileDescriptor {
    /// Open a descriptor for `path` on the group of `devices`. Nothing is read
    /// from the devices yet.
    pub fn open(
        registry: Arc<CacheRegistry>,
        devices: &[DeviceAddress],
        path: &str,
    ) -> Result<Self> {
        let path = FsPath::parse(path)?;
        let owner = registry.new_owner();
        let handle = registry.acquire(devices, owner)?;
        Ok(FileDescriptor {
            registry,
            handle,
            path,
            mode: OpenMode::Closed,
        })
    }

    /// Normalized path of the descriptor
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Address of the device group the descriptor currently works on
    pub fn group(&self) -> DeviceAddress {
        self.handle.key()
    }

    /// Devices of the group in join order
    pub fn devices(&self) -> Vec<DeviceAddress> {
        self.handle.lock().addresses().to_vec()
    }

    fn resolve(&mut self) -> Result<FsLayout> {
        topology::resolve(&self.registry, &mut self.handle)
    }

    /// Resolve the topology and walk the path
    pub fn lookup(&mut self) -> Result<Lookup> {
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        lookup(&mut cache, layout, &self.path)
    }

    /// Entry record of the path, `None` for the root
    pub fn entry(&mut self) -> Result<Option<EntryRecord>> {
        match self.lookup()? {
            Lookup::Root => Ok(None),
            Lookup::Found(entry) => Ok(Some(entry.record)),
            Lookup::Missing { .. } => Err(WireFsError::NotFound {
                path: self.path.to_string(),
            }),
        }
    }

    /// The path names the root or an existing entry. A file standing in
    /// for a parent directory counts as missing.
    pub fn exists(&mut self) -> Result<bool> {
        match self.lookup() {
            Ok(Lookup::Missing { .. }) | Err(WireFsError::NotDirectory { .. }) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// The path is the root or a directory entry
    pub fn is_directory(&mut self) -> Result<bool> {
        match self.lookup() {
            Ok(Lookup::Root) => Ok(true),
            Ok(Lookup::Found(entry)) => Ok(entry.record.is_directory()),
            Ok(Lookup::Missing { .. }) | Err(WireFsError::NotDirectory { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The path is an existing file entry
    pub fn is_file(&mut self) -> Result<bool> {
        match self.lookup() {
            Ok(Lookup::Found(entry)) => Ok(!entry.record.is_directory()),
            Ok(_) | Err(WireFsError::NotDirectory { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The path exists and no other descriptor writes to it
    pub fn can_write(&mut self) -> Result<bool> {
        if !self.exists()? {
            return Ok(false);
        }
        let writing = matches!(self.mode, OpenMode::Write(_));
        Ok(writing || !self.handle.lock().is_open_for_write(&self.path.key()))
    }

    /// Create the file, and any missing parent directory. An existing file
    /// is cut back to an empty first page unless `append` is set.
    pub fn create_file(&mut self, append: bool) -> Result<EntryRecord> {
        match self.path.file_name() {
            Some(name) if name.kind().is_file() => {}
            Some(_) => return Err(invalid(&self.path, "file name needs an extension")),
            None => return Err(invalid(&self.path, "the root is not a file")),
        }
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        if !append && cache.is_open_for_write(&self.path.key()) {
            return Err(WireFsError::AlreadyOpenForWrite {
                path: self.path.to_string(),
            });
        }
        Ok(create_file_in(&mut cache, layout, &self.path, append)?.record)
    }

    /// Create the directory; `parents` also creates missing ancestors.
    /// Returns false when it already exists.
    pub fn mkdir(&mut self, parents: bool) -> Result<bool> {
        let Some(name) = self.path.file_name() else {
            return Ok(false);
        };
        if name.kind().is_file() {
            return Err(invalid(&self.path, "directory names take no extension"));
        }
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        match lookup(&mut cache, layout, &self.path)? {
            Lookup::Root | Lookup::Found(_) => Ok(false),
            Lookup::Missing { resolved, .. }
                if !parents && resolved + 1 < self.path.components().len() =>
            {
                Err(WireFsError::NotFound {
                    path: self
                        .path
                        .parent()
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                })
            }
            Lookup::Missing { dir, resolved } => {
                create_missing(&mut cache, layout, &self.path, dir, resolved)?;
                Ok(true)
            }
        }
    }

    /// Remove the file, or the directory when it is empty
    pub fn delete(&mut self) -> Result<()> {
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        let entry = match lookup(&mut cache, layout, &self.path)? {
            Lookup::Root => return Err(invalid(&self.path, "cannot delete the root directory")),
            Lookup::Missing { .. } => {
                return Err(WireFsError::NotFound {
                    path: self.path.to_string(),
                })
            }
            Lookup::Found(entry) => entry,
        };

        if entry.record.is_directory() {
            if !directory::list(&mut cache, layout, entry.record.start)?.is_empty() {
                return Err(WireFsError::DirectoryNotEmpty {
                    path: self.path.to_string(),
                });
            }
            directory::excise(&mut cache, layout, &entry)?;
            for dir in directory::load_chain(&mut cache, layout, entry.record.start)? {
                cache.free_page(dir.page);
            }
        } else {
            if cache.is_open_for_write(&self.path.key()) {
                return Err(WireFsError::AlreadyOpenForWrite {
                    path: self.path.to_string(),
                });
            }
            directory::excise(&mut cache, layout, &entry)?;
            if !cache.is_write_once() {
                stream::free_chain(&mut cache, layout, entry.record.start)?;
            }
        }
        debug!("Deleted {}", self.path);
        Ok(())
    }

    /// Move the entry to `destination` without touching its content pages
    pub fn rename(&mut self, destination: &str) -> Result<()> {
        let destination = FsPath::parse(destination)?;
        let Some(dest_name) = destination.file_name().copied() else {
            return Err(invalid(&destination, "cannot rename onto the root"));
        };
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();

        let source = match lookup(&mut cache, layout, &self.path)? {
            Lookup::Root => return Err(invalid(&self.path, "cannot rename the root directory")),
            Lookup::Missing { .. } => {
                return Err(WireFsError::NotFound {
                    path: self.path.to_string(),
                })
            }
            Lookup::Found(entry) => entry,
        };
        let is_directory = source.record.is_directory();
        let kind = match (is_directory, dest_name.kind()) {
            (true, EntryKind::File(_)) => {
                return Err(invalid(&destination, "directory names take no extension"))
            }
            (true, _) => EntryKind::Directory,
            (false, EntryKind::File(ext)) => EntryKind::File(ext),
            (false, _) => return Err(invalid(&destination, "file name needs an extension")),
        };
        let destination = destination.with_kind(kind);
        if is_directory && destination.is_within(&self.path) {
            return Err(invalid(&destination, "cannot move a directory inside itself"));
        }
        if cache.is_open_for_write(&self.path.key()) {
            return Err(WireFsError::AlreadyOpenForWrite {
                path: self.path.to_string(),
            });
        }

        let parent = match lookup(&mut cache, layout, &destination)? {
            Lookup::Missing { dir, resolved }
                if resolved + 1 == destination.components().len() =>
            {
                dir
            }
            Lookup::Missing { .. } => {
                return Err(WireFsError::NotFound {
                    path: destination
                        .parent()
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                })
            }
            Lookup::Root | Lookup::Found(_) => {
                return Err(WireFsError::AlreadyExists {
                    path: destination.to_string(),
                })
            }
        };

        let record = EntryRecord::new(
            dest_name.with_kind(kind),
            source.record.start,
            source.record.pages,
        );
        directory::append(&mut cache, layout, parent, record)?;
        directory::excise(&mut cache, layout, &source)?;
        if is_directory && parent != source.dir {
            directory::set_parent(&mut cache, layout, source.record.start, parent)?;
        }
        debug!("Renamed {} to {}", self.path, destination);
        Ok(())
    }

    /// Entries of the directory
    pub fn list(&mut self) -> Result<Vec<EntryRecord>> {
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        let start = match lookup(&mut cache, layout, &self.path)? {
            Lookup::Root => PageId::ROOT,
            Lookup::Found(entry) if entry.record.is_directory() => entry.record.start,
            Lookup::Found(_) => {
                return Err(WireFsError::NotDirectory {
                    path: self.path.to_string(),
                })
            }
            Lookup::Missing { .. } => {
                return Err(WireFsError::NotFound {
                    path: self.path.to_string(),
                })
            }
        };
        Ok(directory::list(&mut cache, layout, start)?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }

    /// Content length of a file, 0 for a directory
    pub fn length(&mut self) -> Result<u64> {
        let layout = self.resolve()?;
        let mut cache = self.handle.lock();
        match lookup(&mut cache, layout, &self.path)? {
            Lookup::Root => Ok(0),
            Lookup::Found(entry) if entry.record.is_directory() => Ok(0),
            Lookup::Found(entry) => stream::chain_length(&mut cache, layout, entry.record.start),
            Lookup::Missing { .. } => Err(WireFsError::NotFound {
                path: self.path.to_string(),
            }),
        }
    }

    /// Free pages of the mounted filesystem
    pub fn free_pages(&mut self) -> Result<usize> {
        self.resolve()?;
        Ok(self.handle.lock().number_free_pages())
    }

    pub fn total_pages(&self) -> usize {
        self.handle.lock().total_pages()
    }

    pub fn stats(&self) -> CacheStats {
        self.handle.lock().stats()
    }

    /// Format the device group as a new, empty filesystem
    pub fn format(&mut self) -> Result<()> {
        self.mode = OpenMode::Closed;
        let mut cache = self.handle.lock();
        cache.release_writer(&self.path.key());
        format::format(&mut cache)?;
        Ok(())
    }

    /// Flush the shared cache of the group
    pub fn sync(&mut self) -> Result<()> {
        self.handle.lock().sync()
    }

    /// Position the read cursor at the start of the file
    pub fn open_read(&mut self) -> Result<()> {
        self.close()?;
        let start = match self.lookup()? {
            Lookup::Found(entry) if !entry.record.is_directory() => entry.record.start,
            Lookup::Root | Lookup::Found(_) => {
                return Err(WireFsError::NotFile {
                    path: self.path.to_string(),
                })
            }
            Lookup::Missing { .. } => {
                return Err(WireFsError::NotFound {
                    path: self.path.to_string(),
                })
            }
        };
        self.mode = OpenMode::Read(Cursor::new(start));
        Ok(())
    }

    /// Claim the path for writing, creating the file when missing. Without
    /// `append` existing content is discarded.
    pub fn open_write(&mut self, append: bool) -> Result<()> {
        self.close()?;
        match self.path.file_name() {
            Some(name) if name.kind().is_file() => {}
            _ => return Err(invalid(&self.path, "file name needs an extension")),
        }
        let layout = self.resolve()?;
        let key = self.path.key();
        let mut cache = self.handle.lock();
        cache.claim_writer(&key)?;

        let opened = create_file_in(&mut cache, layout, &self.path, append).and_then(|entry| {
            let mut cursor = Cursor::new(entry.record.start);
            if append {
                cursor.seek_end(&mut cache, layout)?;
            }
            Ok(cursor)
        });
        match opened {
            Ok(cursor) => {
                self.mode = OpenMode::Write(cursor);
                Ok(())
            }
            Err(e) => {
                cache.release_writer(&key);
                Err(e)
            }
        }
    }

    /// Read from the open read cursor; 0 at end of file
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let layout = topology::resolve(&self.registry, &mut self.handle)?;
        let OpenMode::Read(cursor) = &mut self.mode else {
            return Err(not_open(&self.path, "reading"));
        };
        let mut cache = self.handle.lock();
        cursor.read(&mut cache, layout, buf)
    }

    /// Advance the read cursor by up to `count` bytes
    pub fn skip(&mut self, count: u64) -> Result<u64> {
        let layout = topology::resolve(&self.registry, &mut self.handle)?;
        let OpenMode::Read(cursor) = &mut self.mode else {
            return Err(not_open(&self.path, "reading"));
        };
        let mut cache = self.handle.lock();
        cursor.skip(&mut cache, layout, count)
    }

    /// Append `data` at the write cursor
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let layout = topology::resolve(&self.registry, &mut self.handle)?;
        let OpenMode::Write(cursor) = &mut self.mode else {
            return Err(not_open(&self.path, "writing"));
        };
        let mut cache = self.handle.lock();
        let written = cursor.write(&mut cache, layout, data);

        let added = cursor.take_added();
        if added > 0 {
            if let Lookup::Found(entry) = lookup(&mut cache, layout, &self.path)? {
                let record = EntryRecord {
                    pages: entry.record.pages + added,
                    ..entry.record
                };
                directory::update(&mut cache, layout, &entry, record)?;
            }
        }
        written
    }

    /// Position of the open cursor
    pub fn position(&self) -> u64 {
        match &self.mode {
            OpenMode::Read(cursor) | OpenMode::Write(cursor) => cursor.position(),
            OpenMode::Closed => 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.mode, OpenMode::Closed)
    }

    /// Drop the cursor and flush. A writer gives up its claim on the path
    /// even when the flush fails.
    pub fn close(&mut self) -> Result<()> {
        let mode = std::mem::replace(&mut self.mode, OpenMode::Closed);
        if matches!(mode, OpenMode::Closed) {
            return Ok(());
        }
        let mut cache = self.handle.lock();
        if matches!(mode, OpenMode::Write(_)) {
            cache.release_writer(&self.path.key());
        }
        cache.sync()
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing {} failed: {}", self.path, e);
        }
        self.registry.release(&self.handle);
    }
}

impl std::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("path", &self.path.to_string())
            .field("group", &self.handle.key())
            .field("mode", &self.mode)
            .finish()
    }
}
