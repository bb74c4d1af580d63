//! Error taxonomy for the FAT core (spec §7).
//!
//! The reference implementation splits errors across several C++
//! exception-ish return codes tied to each subsystem. Since every one of
//! those is ultimately translated to a POSIX errno at the adapter boundary
//! anyway, we collapse them into one flat enum here.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FatError>;

/// Errors the core can return to its adapter, one per row of spec §7.
#[derive(Debug, Error)]
pub enum FatError {
    /// A path component was not found.
    #[error("no such file or directory")]
    NoSuchEntry,

    /// `O_CREAT|O_EXCL` raced an existing target, or `Link` named an
    /// already-occupied name.
    #[error("file already exists")]
    AlreadyExists,

    /// A non-directory component was used where a directory was required.
    #[error("not a directory")]
    NotADirectory,

    /// An operation valid only on non-directories (`read`, file-only
    /// `unlink`, ...) was used on a directory.
    #[error("is a directory")]
    IsADirectory,

    /// `rmdir`/`unlink(dir)` on a non-empty directory without `force`.
    #[error("directory not empty")]
    NotEmpty,

    /// Mutation attempted on a read-only mount, or after [`Corrupted`].
    ///
    /// [`Corrupted`]: FatError::Corrupted
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    /// `AllocateCluster` found nothing free, or a directory could not grow.
    #[error("no space left on device")]
    NoSpace,

    /// Write or truncate would exceed FAT's 32-bit size field (4 GiB - 1).
    #[error("file too large")]
    FileTooLarge,

    /// A device I/O error, surfaced either by a failed sector read/write or
    /// by the FAT "bad cluster" sentinel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A path component was too long, failed the UTF-16 round trip, or (for
    /// `Rename`) would move a directory into its own subtree.
    #[error("invalid name")]
    InvalidName,

    /// `symlink`, `mknod`, hard-linking a regular file, or a `chmod` that
    /// isn't expressible as the single read-only bit.
    #[error("operation not supported")]
    NotSupported,

    /// `chown` attempting to change uid/gid away from the mount's
    /// configured identity.
    #[error("permission denied")]
    Permission,

    /// The mount has been irreversibly downgraded to read-only by
    /// [`Filesystem::corrupted`](crate::fs::Filesystem::corrupted).
    #[error("filesystem corrupted, mount downgraded to read-only")]
    Corrupted,
}

impl FatError {
    /// True for errors that leave the filesystem itself undamaged (a
    /// well-formed rejection of the caller's request, not a sign of
    /// on-disk corruption).
    pub fn is_benign(&self) -> bool {
        !matches!(self, FatError::Corrupted | FatError::Io(_))
    }
}
