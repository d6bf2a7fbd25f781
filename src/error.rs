use thiserror::Error;

use crate::id::Id;

/// The error taxonomy for the whole crate.
///
/// I/O errors from the embedder's [`Disk`](crate::disk::Disk) are wrapped
/// once, at the adapter boundary, into [`Error::Read`]/[`Error::Write`] and
/// never unwrapped again; every other variant is raised directly by the core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A read from the backing disk failed.
    #[error("disk read failed")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// A write to the backing disk failed.
    #[error("disk write failed")]
    Write(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// A page's checksum didn't match its stored digest.
    #[error("checksum mismatch on page {0:?}")]
    InvalidChecksum(Id),
    /// Neither superblock generation validated.
    #[error("both superblock generations failed to validate")]
    AllGenerationsCorrupted,
    /// The disk has never been formatted (or the format was not recognized).
    #[error("disk is not formatted")]
    DiskNotFormatted,
    /// The allocator has no more ids to hand out.
    #[error("disk is full")]
    DiskIsFull,
    /// The disk's sector size didn't match the page size recorded at format time.
    #[error("wrong page size: got {got}")]
    WrongPageSize { got: u32 },
    /// The disk's sector count didn't match the size recorded at format time.
    #[error("wrong disk size: got {got}")]
    WrongDiskSize { got: u64 },
    /// The checksum algorithm recorded on disk doesn't match the one supplied at open time.
    #[error("wrong checksum algorithm: on-disk is {name} ({size} bytes)")]
    WrongChecksumAlgorithm { name: String, size: usize },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A fatal, unrecoverable invariant violation.
///
/// These are "programmer error" conditions: they are never returned as
/// [`Error`] values, because a caller can't sensibly
/// recover from them. They indicate a bug in a layer above this crate, so we
/// panic instead of threading them through `Result`.
macro_rules! bug {
    ($($arg:tt)*) => {
        panic!($($arg)*)
    };
}
pub(crate) use bug;
