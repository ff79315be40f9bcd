//! Filename rules for file-backed transfers.

use crate::TransferError;

/// Validates a filename requested by a peer.
///
/// Transfer filenames are bare names resolved against the serving root,
/// never paths: anything containing a path delimiter, and the `.` / `..`
/// pseudo-entries, is rejected before any byte is read.
pub fn validate_transfer_filename(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::PathRejected("empty filename".into()));
    }
    if name == "." || name == ".." {
        return Err(TransferError::PathRejected(name.into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::PathRejected(name.into()));
    }
    Ok(())
}

/// Returns `true` for filenames following the temporary-file convention:
/// 1–46 characters of `[A-Za-z0-9_-]` followed by `.tmp`.
///
/// Delete-on-completion is only honored for these names, so a peer can
/// never talk us into deleting an arbitrary served file.
pub fn is_temp_filename(name: &str) -> bool {
    let len = name.len();
    if !(5..=50).contains(&len) {
        return false;
    }
    let (stem, ext) = name.split_at(len - 4);
    ext == ".tmp"
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
