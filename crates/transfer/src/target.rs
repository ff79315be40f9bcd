//! Inbound stream consumption.
//!
//! A [`TransferTarget`] mirrors the sender: it takes chunks in strict
//! sequence, hands the bytes to a [`ConsumerBackend`], and runs a
//! finalize-or-discard step when the stream ends. Consumers never leave a
//! truncated artifact behind: a partial file or staging entry is removed
//! before the caller's completion callback hears about the failure.
//!
//! The store consumer finalizes asynchronously — its commit runs on the
//! store's worker thread — so its caller callback parks in the shared
//! [`CompletionQueue`] instead of firing inline.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ferry_protocol::{AssetKind, SourceParams, TransferMessage, packet};
use ferry_store::{CompletionQueue, ContentStore, StoreHandle, StoreMode};
use uuid::Uuid;

use crate::{CompletionCallback, PayloadCallback, TransferCode, TransferError, TransferOutcome, Wire};

/// Where an inbound transfer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetState {
    /// Created, request not sent yet (waiting for a request slot).
    Queued,
    /// Request sent, stream expected.
    Requested,
}

/// What [`TransferTarget::data`] made of an arriving chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkDisposition {
    Consumed { packet: u32, is_final: bool },
    /// Re-send of the previous chunk — our confirm got lost. Re-confirm,
    /// don't consume.
    Duplicate { packet: u32 },
    /// Anything else out of sequence. The protocol has no reordering
    /// tolerance; this is unrecoverable.
    OutOfSequence { got: u32, expected: u32 },
}

/// One inbound transfer: sequencing state plus a consumer.
pub struct TransferTarget {
    id: u64,
    peer: SocketAddr,
    params: SourceParams,
    priority: bool,
    consumer: ConsumerBackend,
    state: TargetState,
    expected_packet: u32,
    total_size: u64,
    received: u64,
    finished: bool,
}

impl TransferTarget {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        params: SourceParams,
        priority: bool,
        consumer: ConsumerBackend,
    ) -> Self {
        Self {
            id,
            peer,
            params,
            priority,
            consumer,
            state: TargetState::Queued,
            expected_packet: 0,
            total_size: 0,
            received: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn priority(&self) -> bool {
        self.priority
    }

    pub(crate) fn params(&self) -> &SourceParams {
        &self.params
    }

    pub(crate) fn state(&self) -> TargetState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Total size declared by the stream's first packet (0 until then).
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Emits the wire request for this transfer. Returns `false` when the
    /// circuit is gone.
    pub(crate) fn send_request(&mut self, wire: &mut dyn Wire) -> bool {
        let message = TransferMessage::Request {
            transfer_id: self.id,
            params: self.params.clone(),
            priority: self.priority,
        };
        if !wire.send(self.peer, &message) {
            return false;
        }
        self.state = TargetState::Requested;
        tracing::info!(
            id = format_args!("{:#018x}", self.id),
            peer = %self.peer,
            "requested transfer"
        );
        true
    }

    /// Feeds one arriving chunk through the sequencing check and into the
    /// consumer. I/O failures come back as errors for the manager to
    /// convert into an abort.
    pub(crate) fn data(
        &mut self,
        raw_packet: u32,
        payload: &[u8],
    ) -> Result<ChunkDisposition, TransferError> {
        let n = packet::decode_packet_number(raw_packet);
        let is_final = packet::is_final_packet(raw_packet);

        if n != self.expected_packet {
            if self.expected_packet > 0 && n == self.expected_packet - 1 {
                return Ok(ChunkDisposition::Duplicate { packet: n });
            }
            return Ok(ChunkDisposition::OutOfSequence {
                got: n,
                expected: self.expected_packet,
            });
        }

        // Packet 0 leads with the declared total size so the consumer can
        // pre-allocate.
        let data = if n == 0 {
            let (total, rest) = packet::split_total_size(payload)?;
            self.total_size = total as u64;
            self.consumer.expect_size(total as u64);
            rest
        } else {
            payload
        };

        self.consumer.consume(data)?;
        self.received += data.len() as u64;
        self.expected_packet += 1;
        Ok(ChunkDisposition::Consumed {
            packet: n,
            is_final,
        })
    }

    /// Ends the transfer with `code`: finalizes or discards the consumer
    /// and fires (or parks) the completion callback. Only the first call
    /// does anything.
    pub(crate) fn complete(
        &mut self,
        code: TransferCode,
        completions: &mut CompletionQueue<TransferOutcome>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!(
            id = format_args!("{:#018x}", self.id),
            bytes = self.received,
            ?code,
            "inbound transfer finished"
        );
        self.consumer.complete(code, completions);
    }

    /// Aborts toward the peer and completes locally with `code`.
    pub(crate) fn abort(
        &mut self,
        code: TransferCode,
        wire: &mut dyn Wire,
        completions: &mut CompletionQueue<TransferOutcome>,
    ) {
        if self.finished {
            return;
        }
        let _ = wire.send(
            self.peer,
            &TransferMessage::Abort {
                transfer_id: self.id,
                result: code.to_wire(),
            },
        );
        self.complete(code, completions);
    }
}

impl Drop for TransferTarget {
    fn drop(&mut self) {
        debug_assert!(
            !self.consumer.has_open_handle(),
            "TransferTarget {:#018x} dropped with open consumer handle",
            self.id
        );
    }
}

/// A pluggable byte consumer for one inbound transfer.
pub enum ConsumerBackend {
    Memory(MemoryConsumer),
    File(FileConsumer),
    Store(StoreConsumer),
}

impl ConsumerBackend {
    /// Accumulates into memory and hands the buffer to `callback` at the
    /// end.
    pub fn memory(callback: PayloadCallback) -> Self {
        ConsumerBackend::Memory(MemoryConsumer {
            data: Vec::new(),
            callback: Some(callback),
        })
    }

    /// Writes into `path`. The file is created lazily on the first chunk,
    /// so a transfer that never delivers data never creates an empty file.
    pub fn file(path: PathBuf, callback: CompletionCallback) -> Self {
        ConsumerBackend::File(FileConsumer {
            path,
            file: None,
            callback: Some(callback),
        })
    }

    /// Stages into the content store under a fresh staging identity, to
    /// be committed to `(asset_id, kind)` on success.
    pub fn store(
        store: Arc<dyn ContentStore>,
        asset_id: Uuid,
        kind: AssetKind,
        callback: CompletionCallback,
    ) -> Self {
        ConsumerBackend::Store(StoreConsumer {
            store,
            staging_id: Uuid::new_v4(),
            asset_id,
            kind,
            handle: None,
            expected_size: None,
            callback: Some(callback),
        })
    }

    /// Declares the stream's total size ahead of the first write.
    fn expect_size(&mut self, total: u64) {
        match self {
            ConsumerBackend::Memory(m) => m.data.reserve(total as usize),
            ConsumerBackend::File(_) => {}
            ConsumerBackend::Store(s) => s.expected_size = Some(total),
        }
    }

    /// Appends one chunk of bytes. Writes are strictly sequential.
    fn consume(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        match self {
            ConsumerBackend::Memory(m) => {
                m.data.extend_from_slice(bytes);
                Ok(())
            }
            ConsumerBackend::File(f) => f.consume(bytes),
            ConsumerBackend::Store(s) => s.consume(bytes),
        }
    }

    /// Finalize-or-discard, then deliver the outcome exactly once.
    fn complete(&mut self, code: TransferCode, completions: &mut CompletionQueue<TransferOutcome>) {
        let outcome = code.outcome();
        match self {
            ConsumerBackend::Memory(m) => {
                if let Some(cb) = m.callback.take() {
                    cb(outcome, std::mem::take(&mut m.data));
                }
            }
            ConsumerBackend::File(f) => f.complete(code, outcome),
            ConsumerBackend::Store(s) => s.complete(code, outcome, completions),
        }
    }

    fn has_open_handle(&self) -> bool {
        match self {
            ConsumerBackend::Memory(m) => m.callback.is_some(),
            ConsumerBackend::File(f) => f.file.is_some(),
            ConsumerBackend::Store(s) => s.handle.is_some(),
        }
    }
}

/// Accumulates the stream in memory.
pub struct MemoryConsumer {
    data: Vec<u8>,
    callback: Option<PayloadCallback>,
}

/// Writes the stream to a local file, append-only.
pub struct FileConsumer {
    path: PathBuf,
    file: Option<File>,
    callback: Option<CompletionCallback>,
}

impl FileConsumer {
    fn consume(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        let file = self.file.as_mut().unwrap();
        let n = file.write(bytes)?;
        if n != bytes.len() {
            return Err(TransferError::ShortWrite {
                expected: bytes.len(),
                got: n,
            });
        }
        Ok(())
    }

    fn complete(&mut self, code: TransferCode, outcome: TransferOutcome) {
        let had_file = self.file.take().is_some();
        if code != TransferCode::Done && had_file {
            // Never leave a truncated file looking like a finished one.
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), "failed to remove partial file: {e}");
            }
        }
        if let Some(cb) = self.callback.take() {
            cb(outcome);
        }
    }
}

/// Writes the stream into a staging entry, committing on success.
pub struct StoreConsumer {
    store: Arc<dyn ContentStore>,
    staging_id: Uuid,
    asset_id: Uuid,
    kind: AssetKind,
    handle: Option<StoreHandle>,
    expected_size: Option<u64>,
    callback: Option<CompletionCallback>,
}

impl StoreConsumer {
    fn consume(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if self.handle.is_none() {
            let handle = self
                .store
                .open_staged(self.staging_id, self.kind, StoreMode::Write)?;
            // First write fixes the entry's maximum size.
            if let Some(total) = self.expected_size {
                self.store.set_max_size(handle, total)?;
            }
            self.handle = Some(handle);
        }
        let handle = self.handle.unwrap();
        self.store.write(handle, bytes)?;
        Ok(())
    }

    fn complete(
        &mut self,
        code: TransferCode,
        outcome: TransferOutcome,
        completions: &mut CompletionQueue<TransferOutcome>,
    ) {
        let had_entry = self.handle.take().inspect(|h| self.store.close(*h)).is_some();

        if code == TransferCode::Done {
            // Commit runs on the store's worker thread; the caller hears
            // about it once the handle reports done.
            let handle = self.store.rename_async(
                (self.staging_id, self.kind),
                (self.asset_id, self.kind),
                true,
            );
            if let Some(cb) = self.callback.take() {
                completions.enqueue(handle, outcome, cb);
            }
            return;
        }

        // No rename was requested, so nothing to wait on: discard the
        // staging entry and deliver the failure immediately.
        if had_entry && let Err(e) = self.store.remove(self.staging_id, self.kind) {
            tracing::warn!(staging = %self.staging_id, "failed to remove staging entry: {e}");
        }
        if let Some(cb) = self.callback.take() {
            cb(outcome);
        }
    }
}
