//! Directory entry records
//!
//! On the device an entry is `[name; 4][extension][start; N][pages; N]`. In
//! memory it is an [`EntryRecord`]; bytes only exist at the page boundary.

use crate::core::error::{Result, WireFsError};
use crate::core::header::PointerWidth;
use crate::core::page::PageId;
use std::fmt;

/// Characters in an entry name
pub const NAME_LEN: usize = 4;

/// Largest extension of a file
pub const MAX_FILE_EXTENSION: u8 = 125;

const EXT_UNTYPED: u8 = 0x7E;
const EXT_DIRECTORY: u8 = 0x7F;

/// Extension / type byte of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File(u8),
    Directory,
    /// Path component given without an extension, not yet bound to a type
    Untyped,
}

impl EntryKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0..=MAX_FILE_EXTENSION => Some(EntryKind::File(byte)),
            EXT_DIRECTORY => Some(EntryKind::Directory),
            EXT_UNTYPED => Some(EntryKind::Untyped),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            EntryKind::File(ext) => ext,
            EntryKind::Directory => EXT_DIRECTORY,
            EntryKind::Untyped => EXT_UNTYPED,
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, EntryKind::File(_))
    }

    pub fn is_directory(self) -> bool {
        self == EntryKind::Directory
    }
}

/// Name plus type of one path component or directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryName {
    name: [u8; NAME_LEN],
    kind: EntryKind,
}

impl EntryName {
    /// `name` must already be validated: 1 to 4 printable ASCII characters
    pub(crate) fn new(name: &str, kind: EntryKind) -> Self {
        let mut bytes = [b' '; NAME_LEN];
        for (slot, byte) in bytes.iter_mut().zip(name.bytes()) {
            *slot = byte;
        }
        EntryName { name: bytes, kind }
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Same name and extension but a different type
    pub fn with_kind(&self, kind: EntryKind) -> Self {
        EntryName {
            name: self.name,
            kind,
        }
    }

    /// Name without the space padding
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).trim_end().to_string()
    }

    pub fn name_bytes(&self) -> &[u8; NAME_LEN] {
        &self.name
    }

    /// Case-insensitive match of a path component against a stored entry.
    /// An untyped component only names a directory.
    pub fn matches(&self, entry: &EntryName) -> bool {
        if !self.name.eq_ignore_ascii_case(&entry.name) {
            return false;
        }
        match self.kind {
            EntryKind::Untyped => entry.kind == EntryKind::Directory,
            kind => kind == entry.kind,
        }
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::File(ext) => write!(f, "{}.{}", self.name(), ext),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// One directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    pub name: EntryName,
    pub start: PageId,
    pub pages: u32,
}

impl EntryRecord {
    pub fn new(name: EntryName, start: PageId, pages: u32) -> Self {
        EntryRecord { name, start, pages }
    }

    pub fn is_directory(&self) -> bool {
        self.name.kind.is_directory()
    }

    pub fn encode(&self, width: PointerWidth) -> Vec<u8> {
        let n = width.bytes();
        let mut out = vec![0u8; width.entry_len()];
        out[..NAME_LEN].copy_from_slice(&self.name.name);
        out[NAME_LEN] = self.name.kind.to_byte();
        width.write(self.start.0, &mut out[NAME_LEN + 1..NAME_LEN + 1 + n]);
        width.write(self.pages, &mut out[NAME_LEN + 1 + n..NAME_LEN + 1 + 2 * n]);
        out
    }

    pub fn decode(bytes: &[u8], width: PointerWidth) -> Result<Self> {
        let n = width.bytes();
        if bytes.len() < width.entry_len() {
            return Err(WireFsError::InvalidFilesystem(format!(
                "truncated directory entry ({} bytes)",
                bytes.len()
            )));
        }
        let kind = match EntryKind::from_byte(bytes[NAME_LEN]) {
            Some(EntryKind::Untyped) | None => {
                return Err(WireFsError::InvalidFilesystem(format!(
                    "bad entry type byte 0x{:02X}",
                    bytes[NAME_LEN]
                )))
            }
            Some(kind) => kind,
        };
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&bytes[..NAME_LEN]);
        Ok(EntryRecord {
            name: EntryName { name, kind },
            start: PageId(width.read(&bytes[NAME_LEN + 1..])),
            pages: width.read(&bytes[NAME_LEN + 1 + n..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bytes() {
        assert_eq!(EntryKind::from_byte(0), Some(EntryKind::File(0)));
        assert_eq!(EntryKind::from_byte(125), Some(EntryKind::File(125)));
        assert_eq!(EntryKind::from_byte(0x7F), Some(EntryKind::Directory));
        assert_eq!(EntryKind::from_byte(0x7E), Some(EntryKind::Untyped));
        assert_eq!(EntryKind::from_byte(0x80), None);
    }

    #[test]
    fn test_record_layout() {
        let record = EntryRecord::new(
            EntryName::new("AB", EntryKind::File(7)),
            PageId(0x0102),
            3,
        );
        let bytes = record.encode(PointerWidth::Two);
        assert_eq!(bytes, vec![b'A', b'B', b' ', b' ', 7, 0x02, 0x01, 3, 0]);
        assert_eq!(EntryRecord::decode(&bytes, PointerWidth::Two).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_untyped() {
        let mut bytes = EntryRecord::new(EntryName::new("X", EntryKind::Directory), PageId(1), 0)
            .encode(PointerWidth::One);
        bytes[NAME_LEN] = 0x7E;
        assert!(EntryRecord::decode(&bytes, PointerWidth::One).is_err());
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let stored = EntryName::new("DEMO", EntryKind::File(0));
        assert!(EntryName::new("demo", EntryKind::File(0)).matches(&stored));
        assert!(!EntryName::new("DEMO", EntryKind::File(1)).matches(&stored));
    }

    #[test]
    fn test_untyped_names_directories_only() {
        let dir = EntryName::new("SUB", EntryKind::Directory);
        let file = EntryName::new("SUB", EntryKind::File(0));
        let probe = EntryName::new("sub", EntryKind::Untyped);
        assert!(probe.matches(&dir));
        assert!(!probe.matches(&file));
    }

    #[test]
    fn test_display() {
        assert_eq!(EntryName::new("AB", EntryKind::File(12)).to_string(), "AB.12");
        assert_eq!(EntryName::new("DIR", EntryKind::Directory).to_string(), "DIR");
    }
}
