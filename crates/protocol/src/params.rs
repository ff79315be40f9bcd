//! Self-describing transfer parameter blocks.
//!
//! A `Request` message carries a [`SourceParams`] block telling the
//! serving peer what to read. The block is tagged with its own kind, so
//! the receiving side needs no out-of-band configuration to interpret it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of backend produces (or consumes) the bytes of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Memory,
    File,
    Asset,
}

/// Asset class within the content store.
///
/// Doubles as the file extension for directory-backed stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Blob,
    Image,
    Audio,
    Archive,
}

impl AssetKind {
    /// Extension used when the store keeps entries as plain files.
    pub fn extension(self) -> &'static str {
        match self {
            AssetKind::Blob => "blob",
            AssetKind::Image => "img",
            AssetKind::Audio => "aud",
            AssetKind::Archive => "arc",
        }
    }
}

/// Parameters for a file-backed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileParams {
    /// Bare filename on the serving peer. Never a path: names containing
    /// a path delimiter are rejected before any byte is read.
    pub remote_filename: String,
    /// Delete the served file once the transfer completes successfully.
    /// Only honored for temporary-convention filenames (`*.tmp`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete_on_completion: bool,
    /// Use the large negotiated chunk size.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bulk_packets: bool,
}

/// Parameters for a content-store-backed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetParams {
    pub asset_id: Uuid,
    pub kind: AssetKind,
    /// Use the large negotiated chunk size.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bulk_packets: bool,
}

/// The parameter block carried by a `Request` message.
///
/// Serialized as tagged JSON so the block describes itself on the wire:
/// `{"kind":"file","remoteFilename":"a.tmp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceParams {
    /// The serving peer already holds the payload in memory, registered
    /// under the transfer id ahead of the request.
    Memory,
    File(FileParams),
    Asset(AssetParams),
}

impl SourceParams {
    /// The backend kind this block addresses.
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceParams::Memory => SourceKind::Memory,
            SourceParams::File(_) => SourceKind::File,
            SourceParams::Asset(_) => SourceKind::Asset,
        }
    }
}
