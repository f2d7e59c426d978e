use std::{fmt, io};

use shared_memory::ShmemError;

use crate::core::{KEY_LEN, VALUE_LEN};

#[derive(Debug)]
pub enum StoreError {
    SharedMemory(ShmemError),
    Semaphore(io::Error),
    Io(io::Error),
    SegmentTooSmall { expected: usize, actual: usize },
    EmptyKey,
    KeyTooLong(usize),
    ValueTooLong(usize),
    /// The pod index has no free entry left. Eviction is required to
    /// remove the entry of a key it pushed out of the pod, so a full
    /// index means that cleanup was skipped. This is an internal
    /// consistency failure, never an ordinary "not found".
    IndexFull,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            StoreError::Semaphore(e) => write!(f, "Semaphore error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::SegmentTooSmall { expected, actual } => write!(
                f,
                "Existing segment is {} bytes, the store layout needs {}",
                actual, expected
            ),
            StoreError::EmptyKey => write!(f, "Keys must be at least one byte long"),
            StoreError::KeyTooLong(len) => {
                write!(f, "Key is {} bytes, the limit is {}", len, KEY_LEN)
            }
            StoreError::ValueTooLong(len) => {
                write!(f, "Value is {} bytes, the limit is {}", len, VALUE_LEN)
            }
            StoreError::IndexFull => {
                write!(f, "Pod index has no free entry, eviction cleanup was skipped")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::SharedMemory(e) => Some(e),
            StoreError::Semaphore(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmemError> for StoreError {
    fn from(err: ShmemError) -> Self {
        StoreError::SharedMemory(err)
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}
