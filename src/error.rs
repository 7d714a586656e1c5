use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while operating on a volume.
#[derive(Debug, Error)]
pub enum Error {
    /// The volume could not be opened or its superblock is unusable.
    #[error("failed to open volume: {0}")]
    Open(String),

    /// The mount table could not be read or parsed.
    #[error("could not determine mount state")]
    MountStateUnknown(#[source] io::Error),

    /// The volume is mounted; sparsification refuses to run at all.
    #[error("volume is mounted")]
    Mounted,

    /// The volume is mounted read-write; scrubbing refuses to run.
    #[error("volume is mounted read-write")]
    MountedRw,

    /// A path did not resolve to an inode on the volume.
    #[error("{0}: not found on volume")]
    PathNotFound(String),

    /// The file's metadata cannot be processed (wrong type, extent-mapped,
    /// inline data, out-of-range inode number, corrupt directory block).
    #[error("unsupported file record: {0}")]
    InvalidFileRecord(String),

    #[error("failed to read block {addr}")]
    BlockRead {
        addr: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to write block {addr}")]
    BlockWrite {
        addr: u32,
        #[source]
        source: io::Error,
    },

    /// Dirty metadata could not be written back.
    #[error("failed to flush volume metadata")]
    Flush(#[source] io::Error),

    /// A block walk hit an unreadable indirection block and was abandoned
    /// before any metadata mutation for the file was applied.
    #[error("file walk aborted: indirection block {addr} is unreadable")]
    IterationAborted {
        addr: u32,
        #[source]
        source: io::Error,
    },
}
