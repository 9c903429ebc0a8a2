use thiserror::Error;

use crate::core::provider::DeviceAddress;

/// Failure reported by the bus transport or a memory bank provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0} not present on the bus")]
    NoDevice(DeviceAddress),

    #[error("bus transaction failed: {0}")]
    Bus(String),

    #[error("device reported CRC failure on page {0}")]
    DeviceCrc(usize),

    #[error("operation not supported by memory bank: {0}")]
    Unsupported(&'static str),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Coarse classification of a [`WireFsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    InvalidFilesystem,
    Corruption,
    Capacity,
    Conflict,
    Transport,
    Sync,
}

#[derive(Error, Debug)]
pub enum WireFsError {
    #[error("path not found: {path}")]
    NotFound { path: String },

    #[error("not a directory: {path}")]
    NotDirectory { path: String },

    #[error("not a file: {path}")]
    NotFile { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    #[error("{path} is not open for {mode}")]
    NotOpen { path: String, mode: &'static str },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    #[error("CRC16 mismatch on page {page}")]
    CrcMismatch { page: usize },

    #[error("invalid packet length {length} on page {page}")]
    InvalidPacketLength { page: usize, length: usize },

    #[error("circular page redirection starting at page {page}")]
    CircularRedirect { page: usize },

    #[error("page chain loops back on itself at page {page}")]
    ChainLoop { page: usize },

    #[error("page {page} is out of range ({total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("out of space: no free page available")]
    OutOfSpace,

    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("file already open for write: {path}")]
    AlreadyOpenForWrite { path: String },

    #[error("redirection of page {page} failed")]
    RedirectFailed { page: usize },

    #[error("page bitmap read-back did not match committed image")]
    BitmapVerify,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("flush failed: {0}")]
    Sync(#[source] Box<WireFsError>),
}

impl WireFsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireFsError::NotFound { .. } => ErrorKind::NotFound,
            WireFsError::NotDirectory { .. }
            | WireFsError::NotFile { .. }
            | WireFsError::InvalidPath { .. }
            | WireFsError::NotOpen { .. }
            | WireFsError::InvalidConfig(_) => ErrorKind::InvalidInput,
            WireFsError::InvalidFilesystem(_) => ErrorKind::InvalidFilesystem,
            WireFsError::CrcMismatch { .. }
            | WireFsError::InvalidPacketLength { .. }
            | WireFsError::CircularRedirect { .. }
            | WireFsError::ChainLoop { .. }
            | WireFsError::PageOutOfRange { .. }
            | WireFsError::BitmapVerify => ErrorKind::Corruption,
            WireFsError::OutOfSpace | WireFsError::Capacity(_) => ErrorKind::Capacity,
            WireFsError::AlreadyExists { .. }
            | WireFsError::DirectoryNotEmpty { .. }
            | WireFsError::AlreadyOpenForWrite { .. }
            | WireFsError::RedirectFailed { .. } => ErrorKind::Conflict,
            WireFsError::Transport(_) => ErrorKind::Transport,
            WireFsError::Sync(_) => ErrorKind::Sync,
        }
    }

    /// The underlying failure, looking through a [`WireFsError::Sync`] wrapper.
    pub fn root_cause(&self) -> &WireFsError {
        match self {
            WireFsError::Sync(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl From<WireFsError> for std::io::Error {
    fn from(err: WireFsError) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.root_cause().kind() {
            ErrorKind::NotFound => Io::NotFound,
            ErrorKind::InvalidInput => Io::InvalidInput,
            ErrorKind::Conflict => Io::AlreadyExists,
            ErrorKind::InvalidFilesystem | ErrorKind::Corruption => Io::InvalidData,
            ErrorKind::Capacity | ErrorKind::Transport | ErrorKind::Sync => Io::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, WireFsError>;
