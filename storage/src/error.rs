use track_cache::CacheError;

/// Errors surfaced to callers of the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// No memory or track frames were available.
    #[error("out of memory")]
    NoMemory,
    /// The driver reported an I/O failure.
    #[error("device I/O error")]
    Io,
    /// The device is gone (hangup), or no device has that name.
    #[error("no such device")]
    NoDevice,
    /// The device or partition is already open.
    #[error("device busy")]
    Busy,
    /// Eject was requested on a non-removable device.
    #[error("device is not removable")]
    NotRemovable,
    /// All drive letters are taken.
    #[error("no free drive letter")]
    NoFreeLetter,
}

impl From<CacheError<StorageError>> for StorageError {
    fn from(err: CacheError<StorageError>) -> Self {
        match err {
            CacheError::OutOfMemory => Self::NoMemory,
            CacheError::Io(err) => err,
        }
    }
}
