//! Path objects and byte streams over a filesystem

use crate::core::descriptor::FileDescriptor;
use crate::core::error::Result;
use crate::core::path::FsPath;
use crate::core::provider::DeviceAddress;
use crate::core::record::EntryRecord;
use crate::core::registry::CacheRegistry;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// A path on the filesystem of one device group
pub struct WireFile {
    registry: Arc<CacheRegistry>,
    devices: Vec<DeviceAddress>,
    path: FsPath,
    descriptor: Mutex<FileDescriptor>,
}

impl WireFile {
    /// Path object for `path` on the group of `devices`. Nothing is read
    /// from the devices until the first query.
    pub fn new(registry: Arc<CacheRegistry>, devices: &[DeviceAddress], path: &str) -> Result<Self> {
        let descriptor = FileDescriptor::open(Arc::clone(&registry), devices, path)?;
        Ok(WireFile {
            registry,
            devices: devices.to_vec(),
            path: descriptor.path().clone(),
            descriptor: Mutex::new(descriptor),
        })
    }

    /// Path object for `name` inside this directory
    pub fn child(&self, name: &str) -> Result<WireFile> {
        let path = if self.path.is_root() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        };
        WireFile::new(Arc::clone(&self.registry), &self.devices, &path)
    }

    /// Normalized absolute path
    pub fn path(&self) -> String {
        self.path.to_string()
    }

    /// Last component, empty for the root
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string())
            .unwrap_or_default()
    }

    /// Path of the parent directory, `None` for the root
    pub fn parent(&self) -> Option<String> {
        self.path.parent().map(|p| p.to_string())
    }

    /// The path is the root or names an existing entry
    pub fn exists(&self) -> Result<bool> {
        self.descriptor.lock().exists()
    }

    /// The path is the root or an existing directory
    pub fn is_directory(&self) -> Result<bool> {
        self.descriptor.lock().is_directory()
    }

    /// The path is an existing file
    pub fn is_file(&self) -> Result<bool> {
        self.descriptor.lock().is_file()
    }

    pub fn can_read(&self) -> Result<bool> {
        self.exists()
    }

    /// The path exists and no writer holds it
    pub fn can_write(&self) -> Result<bool> {
        self.descriptor.lock().can_write()
    }

    /// Create this directory; its parent must exist
    pub fn mkdir(&self) -> Result<bool> {
        let mut descriptor = self.descriptor.lock();
        let created = descriptor.mkdir(false)?;
        descriptor.sync()?;
        Ok(created)
    }

    /// Create this directory and every missing parent
    pub fn mkdirs(&self) -> Result<bool> {
        let mut descriptor = self.descriptor.lock();
        let created = descriptor.mkdir(true)?;
        descriptor.sync()?;
        Ok(created)
    }

    /// Create an empty file; false when the path already exists
    pub fn create_new_file(&self) -> Result<bool> {
        let mut descriptor = self.descriptor.lock();
        if descriptor.exists()? {
            return Ok(false);
        }
        descriptor.create_file(false)?;
        descriptor.sync()?;
        Ok(true)
    }

    /// Remove the file or empty directory and flush
    pub fn delete(&self) -> Result<()> {
        let mut descriptor = self.descriptor.lock();
        descriptor.delete()?;
        descriptor.sync()
    }

    /// Move this entry to `destination` on the same filesystem
    pub fn rename_to(&self, destination: &str) -> Result<()> {
        let mut descriptor = self.descriptor.lock();
        descriptor.rename(destination)?;
        descriptor.sync()
    }

    /// Names of the entries of this directory
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .list_entries()?
            .into_iter()
            .map(|record| record.name.to_string())
            .collect())
    }

    /// Directory records of this directory, in directory order
    pub fn list_entries(&self) -> Result<Vec<EntryRecord>> {
        self.descriptor.lock().list()
    }

    /// File length in bytes, 0 for directories
    pub fn length(&self) -> Result<u64> {
        self.descriptor.lock().length()
    }

    /// Directory record of this path, `None` for the root
    pub fn entry(&self) -> Result<Option<EntryRecord>> {
        self.descriptor.lock().entry()
    }

    /// Erase the whole device group and write an empty filesystem
    pub fn format(&self) -> Result<()> {
        self.descriptor.lock().format()
    }

    /// Flush every staged page of the group
    pub fn sync(&self) -> Result<()> {
        self.descriptor.lock().sync()
    }

    /// Pages the allocator can still hand out
    pub fn free_pages(&self) -> Result<usize> {
        self.descriptor.lock().free_pages()
    }

    pub fn total_pages(&self) -> usize {
        self.descriptor.lock().total_pages()
    }

    /// Devices of the group the path currently resolves on
    pub fn devices(&self) -> Vec<DeviceAddress> {
        self.descriptor.lock().devices()
    }

    /// Open the file for reading with its own descriptor
    pub fn reader(&self) -> Result<FileReader> {
        let mut descriptor =
            FileDescriptor::open(Arc::clone(&self.registry), &self.devices, &self.path.to_string())?;
        descriptor.open_read()?;
        Ok(FileReader { descriptor })
    }

    /// Open the file for writing, creating it when missing. Without `append`
    /// existing content is replaced.
    pub fn writer(&self, append: bool) -> Result<FileWriter> {
        let mut descriptor =
            FileDescriptor::open(Arc::clone(&self.registry), &self.devices, &self.path.to_string())?;
        descriptor.open_write(append)?;
        Ok(FileWriter { descriptor })
    }
}

impl std::fmt::Debug for WireFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireFile")
            .field("path", &self.path.to_string())
            .field("devices", &self.devices)
            .finish()
    }
}

/// Sequential reader over one file
#[derive(Debug)]
pub struct FileReader {
    descriptor: FileDescriptor,
}

impl FileReader {
    /// Skip up to `count` bytes, returning how many were skipped
    pub fn skip(&mut self, count: u64) -> Result<u64> {
        self.descriptor.skip(count)
    }

    pub fn position(&self) -> u64 {
        self.descriptor.position()
    }
}

impl io::Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.descriptor.read(buf)?)
    }
}

/// Appending writer over one file; the path stays claimed until drop
#[derive(Debug)]
pub struct FileWriter {
    descriptor: FileDescriptor,
}

impl FileWriter {
    pub fn position(&self) -> u64 {
        self.descriptor.position()
    }

    /// Flush and give up the path
    pub fn close(mut self) -> Result<()> {
        self.descriptor.close()
    }
}

impl io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.descriptor.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.descriptor.sync()?)
    }
}
