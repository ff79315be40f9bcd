//! Content-addressed staging store for ferry transfers.
//!
//! Incoming asset streams are not written straight to their final
//! identity: the final size isn't known until the stream's first packet
//! arrives, and the final identity may not be committed until the whole
//! stream lands. Instead the transfer layer writes into a *staging* entry
//! under a throwaway id, then issues an asynchronous rename to the real
//! (asset id, kind) pair once the stream is done.
//!
//! The [`ContentStore`] trait is the seam: production deployments plug in
//! their storage engine, and [`DirStore`] is the bundled directory-backed
//! implementation with a worker thread performing commits off the caller's
//! thread. [`CompletionQueue`] bridges the gap between "rename issued" and
//! "rename actually done" — callbacks park there until the store reports
//! the operation finished.

mod completion;
mod dir;

pub use completion::CompletionQueue;
pub use dir::DirStore;

use ferry_protocol::AssetKind;
use uuid::Uuid;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such entry: {id}.{kind:?}")]
    NotFound { id: Uuid, kind: AssetKind },

    #[error("stale or unknown store handle")]
    BadHandle,

    #[error("entry opened read-only")]
    ReadOnly,

    #[error("write past declared maximum size ({max} bytes)")]
    MaxSizeExceeded { max: u64 },

    #[error("store is shutting down")]
    ShuttingDown,
}

/// Open mode for a staged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Read,
    Write,
}

/// Opaque handle to an open staged entry. The inner id is minted by the
/// store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreHandle(pub u64);

/// Opaque handle to an in-flight asynchronous rename, pollable via
/// [`ContentStore::query_status`]. The inner id is minted by the store
/// implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenameHandle(pub u64);

/// Status of an asynchronous store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOpStatus {
    Pending,
    Complete,
    /// The operation failed or its record is gone; waiting longer won't help.
    Expired,
}

/// An asynchronously-operating storage engine keyed by identity.
///
/// All methods are callable from the protocol thread and must not block
/// on storage work: `rename_async` hands the commit to the store's own
/// thread and returns a handle to poll.
pub trait ContentStore: Send + Sync {
    /// Opens the entry `(id, kind)` for reading or writing. Writing
    /// creates the entry; reading a missing entry is
    /// [`StoreError::NotFound`].
    fn open_staged(&self, id: Uuid, kind: AssetKind, mode: StoreMode)
    -> Result<StoreHandle, StoreError>;

    /// Declares the maximum size of a written entry. Writes past this
    /// bound fail.
    fn set_max_size(&self, handle: StoreHandle, max: u64) -> Result<(), StoreError>;

    /// Appends `data` to a write-mode entry. Partial writes are errors.
    fn write(&self, handle: StoreHandle, data: &[u8]) -> Result<(), StoreError>;

    /// Reads up to `max` bytes from a read-mode entry. An empty result
    /// means end of entry.
    fn read(&self, handle: StoreHandle, max: usize) -> Result<Vec<u8>, StoreError>;

    /// Size of the entry behind an open handle.
    fn size(&self, handle: StoreHandle) -> Result<u64, StoreError>;

    /// Closes an open handle. Closing an already-closed handle is a no-op.
    fn close(&self, handle: StoreHandle);

    /// Deletes the entry `(id, kind)`.
    fn remove(&self, id: Uuid, kind: AssetKind) -> Result<(), StoreError>;

    /// Commits `from` to `to` on the store's worker thread. With
    /// `auto_delete` the source entry is consumed; without it the source
    /// is left in place. Poll the returned handle for completion.
    fn rename_async(
        &self,
        from: (Uuid, AssetKind),
        to: (Uuid, AssetKind),
        auto_delete: bool,
    ) -> RenameHandle;

    /// Reports the status of an asynchronous rename.
    fn query_status(&self, handle: RenameHandle) -> AsyncOpStatus;
}
