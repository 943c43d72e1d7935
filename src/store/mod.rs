mod file;
mod group;

pub use group::{CommitOutcome, PieceSlice, StoreGroup};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError {
        expected: usize,
        actual: usize,
    },

    // Usually relating to poisoned file locks.
    #[error("sync error: {0}")]
    SyncError(String),

    #[error("piece {0} out of range")]
    PieceOutOfRange(usize),

    #[error("piece {0} not present")]
    PieceNotPresent(usize),

}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StoreError::SyncError(e.to_string())
    }
}

type Result<T, E = StoreError> = std::result::Result<T, E>;
