//! Chunked reliable transfer between cooperating peers.
//!
//! Moves an arbitrarily large byte stream — an in-memory buffer, a local
//! file, or a content-store asset — across a message-oriented, unreliable
//! transport. The protocol is deliberately simple: chunks go out in
//! strictly increasing order, exactly one chunk is in flight at a time,
//! and progress is driven by acknowledgments and an ack timer rather than
//! by blocking calls.
//!
//! The pieces:
//!
//! - [`ChunkSender`] packetizes one outbound stream from a pluggable
//!   [`SourceBackend`] (memory / file / content store).
//! - [`TransferTarget`] consumes an inbound stream in sequence into a
//!   [`ConsumerBackend`] and finalizes (or discards) it at the end.
//! - [`TransferManager`] owns the live transfers on both sides,
//!   dispatches inbound wire messages, and runs the per-tick maintenance
//!   pass (retransmits, timeouts, starting queued work).
//! - [`spawn_ticker`] is the optional tokio loop calling
//!   [`TransferManager::tick`] for embedders who live on the runtime.
//!
//! The transport itself is behind the [`Wire`] trait and is someone
//! else's problem; so is the production content store, behind
//! [`ferry_store::ContentStore`].

mod driver;
mod manager;
mod sender;
mod source;
mod target;
mod validation;

pub use driver::{TickerHandle, spawn_ticker};
pub use manager::{TransferConfig, TransferManager};
pub use sender::{ChunkSender, SenderStatus};
pub use source::SourceBackend;
pub use target::{ConsumerBackend, TransferTarget};
pub use validation::{is_temp_filename, validate_transfer_filename};

use std::net::SocketAddr;

use ferry_protocol::{ProtocolError, TransferMessage};
use ferry_store::StoreError;

/// Protocol-level result taxonomy carried in `Abort` messages and
/// accumulated by the state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCode {
    /// Still in flight; nothing went wrong yet.
    Ok,
    /// Terminal success.
    Done,
    /// Generic I/O or logic failure. Recoverable only by restarting the
    /// whole transfer.
    Error,
    /// Explicit peer- or caller-initiated cancellation.
    Abort,
    /// The requested resource does not exist on the serving side.
    UnknownSource,
    InsufficientPermissions,
    /// Retry budget exhausted waiting for an ack.
    Timeout,
}

impl TransferCode {
    /// Wire form, carried in `Abort.result`.
    pub fn to_wire(self) -> i32 {
        match self {
            TransferCode::Ok => 0,
            TransferCode::Done => 1,
            TransferCode::Error => -1,
            TransferCode::Abort => -2,
            TransferCode::UnknownSource => -3,
            TransferCode::InsufficientPermissions => -4,
            TransferCode::Timeout => -5,
        }
    }

    /// Parses a wire result code. Unknown values collapse to [`Error`](Self::Error).
    pub fn from_wire(raw: i32) -> Self {
        match raw {
            0 => TransferCode::Ok,
            1 => TransferCode::Done,
            -2 => TransferCode::Abort,
            -3 => TransferCode::UnknownSource,
            -4 => TransferCode::InsufficientPermissions,
            -5 => TransferCode::Timeout,
            _ => TransferCode::Error,
        }
    }

    /// Translates protocol status into the caller-facing outcome. This is
    /// the single place that mapping lives.
    pub fn outcome(self) -> TransferOutcome {
        match self {
            TransferCode::Ok | TransferCode::Done => TransferOutcome::Success,
            TransferCode::UnknownSource => TransferOutcome::RequestNotFound,
            TransferCode::InsufficientPermissions => TransferOutcome::PermissionDenied,
            TransferCode::Error | TransferCode::Abort | TransferCode::Timeout => {
                TransferOutcome::GenericFailure
            }
        }
    }
}

/// What the caller's completion callback hears. Exactly one of these per
/// transfer, and a failed transfer never leaves a truncated artifact
/// behind when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    RequestNotFound,
    PermissionDenied,
    GenericFailure,
}

impl TransferOutcome {
    pub fn is_success(self) -> bool {
        self == TransferOutcome::Success
    }
}

/// Completion callback fired exactly once with the final outcome.
pub type CompletionCallback = Box<dyn FnOnce(TransferOutcome) + Send>;

/// Completion callback that also hands over the transferred payload
/// (memory backends, where nothing needs to be read back from storage).
pub type PayloadCallback = Box<dyn FnOnce(TransferOutcome, Vec<u8>) + Send>;

/// Errors inside the transfer machinery. These never cross the
/// protocol/backend boundary raw: they convert to a [`TransferCode`] via
/// [`TransferError::as_code`] and surface through the completion callback.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid transfer filename: {0}")]
    PathRejected(String),

    #[error("short write: gave {expected} bytes, backend took {got}")]
    ShortWrite { expected: usize, got: usize },

    #[error("backend ran out of data before the declared total size")]
    UnexpectedEof,

    #[error("transport circuit is gone")]
    CircuitGone,

    #[error("no content store configured")]
    StoreUnavailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("wire error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl TransferError {
    /// The protocol code this failure aborts with.
    pub fn as_code(&self) -> TransferCode {
        match self {
            TransferError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => TransferCode::UnknownSource,
                std::io::ErrorKind::PermissionDenied => TransferCode::InsufficientPermissions,
                _ => TransferCode::Error,
            },
            TransferError::PathRejected(_) => TransferCode::InsufficientPermissions,
            TransferError::Store(StoreError::NotFound { .. }) => TransferCode::UnknownSource,
            _ => TransferCode::Error,
        }
    }
}

/// Outbound half of the unreliable message transport.
///
/// Returns `false` when the circuit to `peer` is gone — there is nowhere
/// left to send, which also suppresses the farewell `Abort` message.
pub trait Wire {
    fn send(&mut self, peer: SocketAddr, message: &TransferMessage) -> bool;
}
