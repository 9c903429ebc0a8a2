//! Path parsing
//!
//! Paths are slash separated, relative to the root. A component is a name of
//! up to four characters, optionally followed by `.` and a numeric extension
//! 0..=125. `.` and `..` are resolved while parsing.

use crate::core::error::{Result, WireFsError};
use crate::core::record::{EntryKind, EntryName, MAX_FILE_EXTENSION, NAME_LEN};
use std::fmt;

/// Parsed, normalized path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FsPath {
    components: Vec<EntryName>,
}

fn invalid(path: &str, reason: &'static str) -> WireFsError {
    WireFsError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

fn parse_component(path: &str, component: &str) -> Result<EntryName> {
    let (name, kind) = match component.split_once('.') {
        Some((name, ext)) => {
            if ext.is_empty() || !ext.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(path, "extension must be a number"));
            }
            let ext: u32 = ext
                .parse()
                .map_err(|_| invalid(path, "extension must be a number"))?;
            if ext > MAX_FILE_EXTENSION as u32 {
                return Err(invalid(path, "extension larger than 125"));
            }
            (name, EntryKind::File(ext as u8))
        }
        None => (component, EntryKind::Untyped),
    };
    if name.is_empty() {
        return Err(invalid(path, "empty name"));
    }
    if name.len() > NAME_LEN {
        return Err(invalid(path, "name longer than 4 characters"));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(invalid(path, "name must be printable ASCII"));
    }
    Ok(EntryName::new(name, kind))
}

impl FsPath {
    pub fn root() -> Self {
        FsPath::default()
    }

    /// Parse a path from the root; `.` and `..` components are folded
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let mut components = Vec::new();
        if trimmed.is_empty() {
            return Ok(FsPath { components });
        }
        for part in trimmed.split('/') {
            match part {
                "" => return Err(invalid(path, "empty path component")),
                "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(invalid(path, "path leads above the root"));
                    }
                }
                _ => components.push(parse_component(path, part)?),
            }
        }
        Ok(FsPath { components })
    }

    pub fn components(&self) -> &[EntryName] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn file_name(&self) -> Option<&EntryName> {
        self.components.last()
    }

    /// Path without its last component, `None` for the root
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        Some(FsPath {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// Replace the type of the last component
    pub fn with_kind(&self, kind: EntryKind) -> FsPath {
        let mut components = self.components.clone();
        if let Some(last) = components.last_mut() {
            *last = last.with_kind(kind);
        }
        FsPath { components }
    }

    /// `self` lies inside (or is) `ancestor`, compared by name only
    pub fn is_within(&self, ancestor: &FsPath) -> bool {
        ancestor.components.len() <= self.components.len()
            && ancestor
                .components
                .iter()
                .zip(&self.components)
                .all(|(a, b)| a.name_bytes().eq_ignore_ascii_case(b.name_bytes()))
    }

    /// Upper-cased form used as a key for open-for-write tracking
    pub fn key(&self) -> String {
        self.to_string().to_ascii_uppercase()
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}
