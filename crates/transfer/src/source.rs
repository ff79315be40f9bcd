//! Backends that produce the bytes a [`crate::ChunkSender`] packetizes.
//!
//! Three variants, one closed enum: the whole payload handed over up
//! front (memory), a file under the serving root (sequential reads only,
//! matching the protocol's no-reordering rule), or a committed entry in
//! the content store. The common contract is `open` / `produce` / `close`;
//! `close` is where each backend's completion side effect lives.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_protocol::AssetKind;
use ferry_store::{ContentStore, StoreHandle, StoreMode};
use uuid::Uuid;

use crate::sender::Window;
use crate::validation::{is_temp_filename, validate_transfer_filename};
use crate::{PayloadCallback, TransferError, TransferOutcome};

/// A pluggable byte producer for one outbound transfer.
pub enum SourceBackend {
    Memory(MemorySource),
    File(FileSource),
    Asset(AssetSource),
}

impl SourceBackend {
    /// A memory source serving `data`, handing it back through `callback`
    /// when the transfer ends. The only sender-side callback that carries
    /// the payload itself — nothing needs to be read back from storage.
    pub fn memory(data: Vec<u8>, callback: PayloadCallback) -> Self {
        SourceBackend::Memory(MemorySource {
            data,
            cursor: 0,
            callback: Some(callback),
        })
    }

    /// A file source for `filename` under `root`. The name is validated
    /// here — before anything is opened or read.
    pub fn file(
        root: &Path,
        filename: &str,
        delete_on_completion: bool,
    ) -> Result<Self, TransferError> {
        validate_transfer_filename(filename)?;
        Ok(SourceBackend::File(FileSource {
            path: root.join(filename),
            filename: filename.to_string(),
            delete_on_completion,
            file: None,
            size: 0,
            read: 0,
        }))
    }

    /// A source reading the committed entry `(asset_id, kind)` from the
    /// content store.
    pub fn asset(store: Arc<dyn ContentStore>, asset_id: Uuid, kind: AssetKind) -> Self {
        SourceBackend::Asset(AssetSource {
            store,
            asset_id,
            kind,
            handle: None,
            size: 0,
            read: 0,
        })
    }

    /// Opens the backend. Returns the stream size when the backend can
    /// know it (files and assets report it; memory knew it all along).
    pub fn open(&mut self) -> Result<Option<u64>, TransferError> {
        match self {
            SourceBackend::Memory(m) => Ok(Some(m.data.len() as u64)),
            SourceBackend::File(f) => f.open(),
            SourceBackend::Asset(a) => a.open(),
        }
    }

    /// Produces up to `max` bytes at the backend's current position.
    /// The bool reports whether the returned bytes end the stream.
    pub fn produce(&mut self, max: usize) -> Result<(Vec<u8>, bool), TransferError> {
        match self {
            SourceBackend::Memory(m) => Ok(m.produce(max)),
            SourceBackend::File(f) => f.produce(max),
            SourceBackend::Asset(a) => a.produce(max),
        }
    }

    /// Makes room in an overflowing window. Sequential backends drop the
    /// already-consumed run; a memory backend has nowhere to put it.
    pub(crate) fn flush(&mut self, window: &mut Window) -> Result<(), TransferError> {
        match self {
            SourceBackend::Memory(_) => Err(TransferError::InvalidState(
                "memory source window must hold the whole stream",
            )),
            SourceBackend::File(_) | SourceBackend::Asset(_) => {
                let end = window.end();
                window.reset(end);
                Ok(())
            }
        }
    }

    /// Closes the backend and runs its completion side effect. Safe to
    /// call more than once; only the first call does anything observable.
    pub fn close(&mut self, outcome: TransferOutcome) {
        match self {
            SourceBackend::Memory(m) => {
                if let Some(cb) = m.callback.take() {
                    cb(outcome, std::mem::take(&mut m.data));
                }
            }
            SourceBackend::File(f) => f.close(outcome),
            SourceBackend::Asset(a) => a.close(),
        }
    }

    /// Whether the backend still holds an open handle or an unfired
    /// callback.
    pub(crate) fn has_open_handle(&self) -> bool {
        match self {
            SourceBackend::Memory(m) => m.callback.is_some(),
            SourceBackend::File(f) => f.file.is_some(),
            SourceBackend::Asset(a) => a.handle.is_some(),
        }
    }

    /// Short human label for logs.
    pub fn describe(&self) -> String {
        match self {
            SourceBackend::Memory(m) => format!("memory({} bytes)", m.data.len()),
            SourceBackend::File(f) => format!("file({})", f.filename),
            SourceBackend::Asset(a) => format!("asset({}.{})", a.asset_id, a.kind.extension()),
        }
    }
}

/// Whole payload supplied up front.
pub struct MemorySource {
    data: Vec<u8>,
    cursor: usize,
    callback: Option<PayloadCallback>,
}

impl MemorySource {
    fn produce(&mut self, max: usize) -> (Vec<u8>, bool) {
        let end = (self.cursor + max).min(self.data.len());
        let bytes = self.data[self.cursor..end].to_vec();
        self.cursor = end;
        (bytes, self.cursor == self.data.len())
    }
}

/// Sequential reader over a served file.
pub struct FileSource {
    path: PathBuf,
    filename: String,
    delete_on_completion: bool,
    file: Option<File>,
    size: u64,
    read: u64,
}

impl FileSource {
    fn open(&mut self) -> Result<Option<u64>, TransferError> {
        let file = File::open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(Some(self.size))
    }

    fn produce(&mut self, max: usize) -> Result<(Vec<u8>, bool), TransferError> {
        let file = self
            .file
            .as_mut()
            .ok_or(TransferError::InvalidState("produce before open"))?;
        let mut buf = vec![0u8; max];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        self.read += n as u64;
        Ok((buf, self.read >= self.size || n == 0))
    }

    fn close(&mut self, outcome: TransferOutcome) {
        if self.file.take().is_none() {
            return;
        }
        // Only temp-convention files are ever deleted, and only after the
        // peer actually got the bytes.
        if self.delete_on_completion && outcome.is_success() && is_temp_filename(&self.filename) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(file = %self.filename, "failed to delete served temp file: {e}");
            }
        }
    }
}

/// Sequential reader over a committed content-store entry.
pub struct AssetSource {
    store: Arc<dyn ContentStore>,
    asset_id: Uuid,
    kind: AssetKind,
    handle: Option<StoreHandle>,
    size: u64,
    read: u64,
}

impl AssetSource {
    fn open(&mut self) -> Result<Option<u64>, TransferError> {
        let handle = self
            .store
            .open_staged(self.asset_id, self.kind, StoreMode::Read)?;
        self.size = self.store.size(handle)?;
        self.handle = Some(handle);
        Ok(Some(self.size))
    }

    fn produce(&mut self, max: usize) -> Result<(Vec<u8>, bool), TransferError> {
        let handle = self
            .handle
            .ok_or(TransferError::InvalidState("produce before open"))?;
        let bytes = self.store.read(handle, max)?;
        self.read += bytes.len() as u64;
        let at_end = self.read >= self.size || bytes.is_empty();
        Ok((bytes, at_end))
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.close(handle);
        }
    }
}
