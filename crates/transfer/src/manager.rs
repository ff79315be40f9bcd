//! Ownership and scheduling of live transfers.
//!
//! One [`TransferManager`] per peer-facing endpoint. It keeps the
//! outbound senders and inbound targets, dispatches inbound wire
//! messages to the matching transfer, and runs the per-tick maintenance
//! pass: ack timeouts (resend, then give up), registration timeouts, and
//! starting queued work up to the concurrency caps — priority transfers
//! first.
//!
//! Everything runs on one logical thread. Call [`TransferManager::tick`]
//! once per scheduler tick, or let [`crate::spawn_ticker`] do it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::packet::{BULK_CHUNK_SIZE, DEFAULT_CHUNK_SIZE};
use ferry_protocol::{AssetKind, AssetParams, FileParams, SourceParams, TransferMessage};
use ferry_store::{CompletionQueue, ContentStore};
use uuid::Uuid;

use crate::sender::{ChunkSender, SenderStatus};
use crate::source::SourceBackend;
use crate::target::{ChunkDisposition, ConsumerBackend, TargetState, TransferTarget};
use crate::{
    CompletionCallback, PayloadCallback, TransferCode, TransferError, TransferOutcome, Wire,
};

/// Tuning knobs for a manager. The defaults match the protocol's
/// historical behavior: 3-second ack timeout, 10 retries, 60-second
/// registration window, 10 concurrent sends per peer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per chunk unless a request negotiates bulk packets.
    pub chunk_size: usize,
    /// Sender window capacity in bytes.
    pub window_capacity: usize,
    /// How long to wait for an ack before resending.
    pub packet_timeout: Duration,
    /// Resends before the transfer is dropped.
    pub retry_limit: u32,
    /// How long a registered transfer may sit unrequested.
    pub registration_timeout: Duration,
    /// Concurrent in-progress sends per peer.
    pub max_active_sends_per_peer: usize,
    /// Concurrent outstanding inbound requests.
    pub max_active_requests: usize,
    /// Directory that file transfers are served out of.
    pub files_root: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_capacity: 64 * 1024,
            packet_timeout: Duration::from_secs(3),
            retry_limit: 10,
            registration_timeout: Duration::from_secs(60),
            max_active_sends_per_peer: 10,
            max_active_requests: 100,
            files_root: PathBuf::from("."),
        }
    }
}

/// Owns every live transfer on this endpoint.
pub struct TransferManager {
    config: TransferConfig,
    store: Option<Arc<dyn ContentStore>>,
    senders: Vec<ChunkSender>,
    targets: Vec<TransferTarget>,
    completions: CompletionQueue<TransferOutcome>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, store: Option<Arc<dyn ContentStore>>) -> Self {
        Self {
            config,
            store,
            senders: Vec::new(),
            targets: Vec::new(),
            completions: CompletionQueue::new(),
        }
    }

    /// Allocates a fresh 64-bit transfer id.
    pub fn next_transfer_id() -> u64 {
        let uuid = Uuid::new_v4();
        u64::from_le_bytes(uuid.as_bytes()[..8].try_into().unwrap())
    }

    // ------------------------------------------------------------------
    // Outbound registration
    // ------------------------------------------------------------------

    /// Parks `data` for sending, to be served when a peer requests the
    /// returned id. The id travels to the peer out of band. If nobody
    /// asks within the registration window the callback fires with a
    /// failure.
    pub fn register_memory_send(&mut self, data: Vec<u8>, callback: PayloadCallback) -> u64 {
        let id = Self::next_transfer_id();
        let total = data.len() as u64;
        let backend = SourceBackend::memory(data, callback);
        let mut sender = ChunkSender::new(
            id,
            backend,
            self.config.chunk_size,
            self.config.window_capacity,
        );
        sender.set_total_size(total);
        sender.mark_registered();
        tracing::info!(
            id = format_args!("{id:#018x}"),
            bytes = total,
            "registered memory transfer"
        );
        self.senders.push(sender);
        id
    }

    // ------------------------------------------------------------------
    // Inbound requests (this endpoint asks a peer for a stream)
    // ------------------------------------------------------------------

    /// Requests the peer's file `remote_filename`, writing it to
    /// `local_path`. An identical in-flight request is coalesced: the
    /// existing id is returned and the new callback is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn request_file(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        local_path: PathBuf,
        remote_filename: impl Into<String>,
        delete_remote_on_completion: bool,
        priority: bool,
        bulk_packets: bool,
        callback: CompletionCallback,
    ) -> u64 {
        let params = SourceParams::File(FileParams {
            remote_filename: remote_filename.into(),
            delete_on_completion: delete_remote_on_completion,
            bulk_packets,
        });
        if let Some(existing) = self.find_duplicate(peer, &params) {
            tracing::warn!(
                id = format_args!("{existing:#018x}"),
                "duplicate transfer request coalesced; new callback dropped"
            );
            return existing;
        }
        let consumer = ConsumerBackend::file(local_path, callback);
        self.enqueue_target(wire, peer, params, priority, consumer)
    }

    /// Requests a stream the peer registered in memory under
    /// `transfer_id`; the accumulated bytes come back through `callback`.
    pub fn request_memory(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        transfer_id: u64,
        priority: bool,
        callback: PayloadCallback,
    ) -> u64 {
        let consumer = ConsumerBackend::memory(callback);
        self.enqueue_target_with_id(wire, transfer_id, peer, SourceParams::Memory, priority, consumer)
    }

    /// Requests a stream the peer registered under `transfer_id`,
    /// writing it to `local_path` instead of holding it in memory.
    pub fn request_registered_file(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        transfer_id: u64,
        local_path: PathBuf,
        priority: bool,
        callback: CompletionCallback,
    ) -> u64 {
        let consumer = ConsumerBackend::file(local_path, callback);
        self.enqueue_target_with_id(wire, transfer_id, peer, SourceParams::Memory, priority, consumer)
    }

    /// Requests the peer's asset `(asset_id, kind)`, staging it into the
    /// local content store and committing it under the same identity.
    pub fn request_asset(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        asset_id: Uuid,
        kind: AssetKind,
        priority: bool,
        bulk_packets: bool,
        callback: CompletionCallback,
    ) -> Result<u64, TransferError> {
        let store = self.store.clone().ok_or(TransferError::StoreUnavailable)?;
        let params = SourceParams::Asset(AssetParams {
            asset_id,
            kind,
            bulk_packets,
        });
        if let Some(existing) = self.find_duplicate(peer, &params) {
            tracing::warn!(
                id = format_args!("{existing:#018x}"),
                "duplicate transfer request coalesced; new callback dropped"
            );
            return Ok(existing);
        }
        let consumer = ConsumerBackend::store(store, asset_id, kind, callback);
        Ok(self.enqueue_target(wire, peer, params, priority, consumer))
    }

    fn find_duplicate(&self, peer: SocketAddr, params: &SourceParams) -> Option<u64> {
        self.targets
            .iter()
            .find(|t| t.peer() == peer && t.params() == params)
            .map(|t| t.id())
    }

    fn enqueue_target(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        params: SourceParams,
        priority: bool,
        consumer: ConsumerBackend,
    ) -> u64 {
        let id = Self::next_transfer_id();
        self.enqueue_target_with_id(wire, id, peer, params, priority, consumer)
    }

    fn enqueue_target_with_id(
        &mut self,
        wire: &mut dyn Wire,
        id: u64,
        peer: SocketAddr,
        params: SourceParams,
        priority: bool,
        consumer: ConsumerBackend,
    ) -> u64 {
        let target = TransferTarget::new(id, peer, params, priority, consumer);
        self.targets.push(target);
        self.start_pending_requests(wire);
        id
    }

    // ------------------------------------------------------------------
    // Inbound message dispatch
    // ------------------------------------------------------------------

    /// Routes one inbound wire message to the transfer it belongs to.
    pub fn handle_message(&mut self, wire: &mut dyn Wire, peer: SocketAddr, message: TransferMessage) {
        match message {
            TransferMessage::Request {
                transfer_id,
                params,
                priority,
            } => self.process_request(wire, peer, transfer_id, params, priority),
            TransferMessage::Chunk {
                transfer_id,
                packet,
                payload,
            } => self.process_chunk(wire, peer, transfer_id, packet, &payload),
            TransferMessage::Confirm {
                transfer_id,
                packet,
            } => self.process_confirm(wire, peer, transfer_id, packet),
            TransferMessage::Abort {
                transfer_id,
                result,
            } => self.process_abort(transfer_id, result),
        }
    }

    /// A peer asked this endpoint to serve a stream.
    pub fn process_request(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        transfer_id: u64,
        params: SourceParams,
        priority: bool,
    ) {
        tracing::info!(
            id = format_args!("{transfer_id:#018x}"),
            peer = %peer,
            kind = ?params.kind(),
            "transfer requested"
        );

        let chunk_size = match &params {
            SourceParams::File(p) if p.bulk_packets => BULK_CHUNK_SIZE,
            SourceParams::Asset(p) if p.bulk_packets => BULK_CHUNK_SIZE,
            _ => self.config.chunk_size,
        };

        let sender_index = match params {
            SourceParams::Memory => {
                // Memory streams are registered ahead of the request.
                match self
                    .senders
                    .iter()
                    .position(|s| s.id() == transfer_id && s.status() == SenderStatus::Registered)
                {
                    Some(index) => index,
                    None => {
                        tracing::warn!(
                            id = format_args!("{transfer_id:#018x}"),
                            "request for unknown registered transfer"
                        );
                        let _ = wire.send(
                            peer,
                            &TransferMessage::Abort {
                                transfer_id,
                                result: TransferCode::UnknownSource.to_wire(),
                            },
                        );
                        return;
                    }
                }
            }
            SourceParams::File(p) => {
                let backend = match SourceBackend::file(
                    &self.config.files_root,
                    &p.remote_filename,
                    p.delete_on_completion,
                ) {
                    Ok(backend) => backend,
                    Err(e) => {
                        tracing::warn!(
                            id = format_args!("{transfer_id:#018x}"),
                            file = %p.remote_filename,
                            "rejected file request: {e}"
                        );
                        let _ = wire.send(
                            peer,
                            &TransferMessage::Abort {
                                transfer_id,
                                result: e.as_code().to_wire(),
                            },
                        );
                        return;
                    }
                };
                self.push_sender(transfer_id, backend, chunk_size)
            }
            SourceParams::Asset(p) => {
                let Some(store) = self.store.clone() else {
                    tracing::warn!(
                        id = format_args!("{transfer_id:#018x}"),
                        "asset requested but no content store configured"
                    );
                    let _ = wire.send(
                        peer,
                        &TransferMessage::Abort {
                            transfer_id,
                            result: TransferCode::UnknownSource.to_wire(),
                        },
                    );
                    return;
                };
                let backend = SourceBackend::asset(store, p.asset_id, p.kind);
                self.push_sender(transfer_id, backend, chunk_size)
            }
        };

        // Open the backend; failures abort toward the requester with the
        // mapped code (missing file -> unknown source, and so on).
        let started = self.senders[sender_index].start(peer, priority, wire).is_ok();
        if started && self.active_sends_to(peer) < self.config.max_active_sends_per_peer {
            self.senders[sender_index].send_next_packet(wire);
        }
        self.sweep_senders();
    }

    fn push_sender(&mut self, id: u64, backend: SourceBackend, chunk_size: usize) -> usize {
        let sender = ChunkSender::new(id, backend, chunk_size, self.config.window_capacity);
        self.senders.push(sender);
        self.senders.len() - 1
    }

    /// A chunk arrived for one of our targets.
    pub fn process_chunk(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        transfer_id: u64,
        raw_packet: u32,
        payload: &[u8],
    ) {
        let Some(index) = self.targets.iter().position(|t| t.id() == transfer_id) else {
            tracing::warn!(
                id = format_args!("{transfer_id:#018x}"),
                peer = %peer,
                "chunk for unknown transfer dropped"
            );
            return;
        };

        let target = &mut self.targets[index];
        match target.data(raw_packet, payload) {
            Ok(ChunkDisposition::Consumed { packet, is_final }) => {
                let confirmed = wire.send(
                    peer,
                    &TransferMessage::Confirm {
                        transfer_id,
                        packet,
                    },
                );
                if !confirmed {
                    // Circuit is gone; nothing further can arrive.
                    target.complete(TransferCode::Error, &mut self.completions);
                } else if is_final {
                    target.complete(TransferCode::Done, &mut self.completions);
                }
            }
            Ok(ChunkDisposition::Duplicate { packet }) => {
                // Our confirm was lost; re-confirm so the sender advances.
                tracing::debug!(
                    id = format_args!("{transfer_id:#018x}"),
                    packet,
                    "re-confirming duplicate chunk"
                );
                let _ = wire.send(
                    peer,
                    &TransferMessage::Confirm {
                        transfer_id,
                        packet,
                    },
                );
            }
            Ok(ChunkDisposition::OutOfSequence { got, expected }) => {
                tracing::warn!(
                    id = format_args!("{transfer_id:#018x}"),
                    got,
                    expected,
                    "out-of-sequence chunk; aborting transfer"
                );
                target.abort(TransferCode::Error, wire, &mut self.completions);
            }
            Err(e) => {
                tracing::warn!(
                    id = format_args!("{transfer_id:#018x}"),
                    "failed to consume chunk: {e}"
                );
                target.abort(e.as_code(), wire, &mut self.completions);
            }
        }

        self.sweep_targets();
    }

    /// The peer confirmed our in-flight chunk.
    pub fn process_confirm(
        &mut self,
        wire: &mut dyn Wire,
        peer: SocketAddr,
        transfer_id: u64,
        packet: u32,
    ) {
        let Some(index) = self.senders.iter().position(|s| s.id() == transfer_id) else {
            tracing::debug!(
                id = format_args!("{transfer_id:#018x}"),
                peer = %peer,
                "confirm for unknown transfer"
            );
            return;
        };

        let sender = &mut self.senders[index];
        // A stale re-confirm (the receiver saw a duplicate chunk) must
        // not count as the ack for the chunk currently in flight.
        if !sender.awaiting_ack() || packet as i64 != sender.packet_cursor() {
            return;
        }
        sender.ack_received();
        match sender.status() {
            SenderStatus::InProgress => sender.send_next_packet(wire),
            SenderStatus::Complete => sender.complete(),
            _ => {}
        }
        self.sweep_senders();
    }

    /// The peer gave up on a transfer, either direction.
    pub fn process_abort(&mut self, transfer_id: u64, result: i32) {
        let code = TransferCode::from_wire(result);

        if let Some(target) = self.targets.iter_mut().find(|t| t.id() == transfer_id) {
            tracing::info!(
                id = format_args!("{transfer_id:#018x}"),
                ?code,
                "peer aborted inbound transfer"
            );
            target.complete(code, &mut self.completions);
            self.targets.retain(|t| !t.is_finished());
            return;
        }

        if let Some(sender) = self.senders.iter_mut().find(|s| s.id() == transfer_id) {
            tracing::info!(
                id = format_args!("{transfer_id:#018x}"),
                ?code,
                "peer aborted outbound transfer"
            );
            sender.abort_quiet(code);
            self.sweep_senders();
            return;
        }

        tracing::warn!(
            id = format_args!("{transfer_id:#018x}"),
            "abort for unknown transfer"
        );
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One maintenance pass: resend or drop timed-out sends, expire
    /// never-requested registrations, start queued work, poll deferred
    /// completions. Call once per scheduler tick.
    pub fn tick(&mut self, wire: &mut dyn Wire) {
        let timeout = self.config.packet_timeout;
        let retry_limit = self.config.retry_limit;
        let registration_timeout = self.config.registration_timeout;

        for sender in &mut self.senders {
            if sender.awaiting_ack() && sender.ack_elapsed() > timeout {
                if sender.retry_count() >= retry_limit {
                    tracing::warn!(
                        id = format_args!("{:#018x}", sender.id()),
                        retries = sender.retry_count(),
                        "retry budget exhausted; dropping transfer"
                    );
                    sender.abort(TransferCode::Timeout, wire);
                } else {
                    tracing::info!(
                        id = format_args!("{:#018x}", sender.id()),
                        packet = sender.packet_cursor(),
                        "ack timeout; resending"
                    );
                    sender.resend_last_packet(wire);
                }
            } else if sender.status() == SenderStatus::Registered
                && sender.age() > registration_timeout
            {
                tracing::info!(
                    id = format_args!("{:#018x}", sender.id()),
                    "registered transfer never requested; dropping"
                );
                sender.abort_quiet(TransferCode::Timeout);
            }
        }

        self.start_pending_sends(wire);
        self.start_pending_requests(wire);
        self.sweep_senders();
        self.sweep_targets();

        if let Some(store) = self.store.clone() {
            self.completions.drain(store.as_ref(), false);
        }
    }

    /// Tears everything down: every live transfer completes with an
    /// abort outcome and the completion queue is force-drained so no
    /// stuck store handle can wedge shutdown.
    pub fn shutdown(&mut self, wire: &mut dyn Wire) {
        for target in &mut self.targets {
            target.abort(TransferCode::Abort, wire, &mut self.completions);
        }
        self.targets.clear();
        for sender in &mut self.senders {
            sender.abort_quiet(TransferCode::Abort);
        }
        self.senders.clear();
        if let Some(store) = self.store.clone() {
            self.completions.drain(store.as_ref(), true);
        }
    }

    fn active_sends_to(&self, peer: SocketAddr) -> usize {
        self.senders
            .iter()
            .filter(|s| {
                s.peer() == Some(peer)
                    && (s.status() == SenderStatus::InProgress
                        || (s.status() == SenderStatus::Complete && s.awaiting_ack()))
            })
            .count()
    }

    /// Starts pending senders while their peer has spare send slots,
    /// priority transfers first.
    fn start_pending_sends(&mut self, wire: &mut dyn Wire) {
        for want_priority in [true, false] {
            for index in 0..self.senders.len() {
                let sender = &self.senders[index];
                if sender.status() != SenderStatus::Pending || sender.priority() != want_priority {
                    continue;
                }
                let Some(peer) = sender.peer() else { continue };
                if self.active_sends_to(peer) < self.config.max_active_sends_per_peer {
                    self.senders[index].send_next_packet(wire);
                }
            }
        }
    }

    /// Emits wire requests for queued targets up to the outstanding
    /// request cap, priority transfers first.
    fn start_pending_requests(&mut self, wire: &mut dyn Wire) {
        let mut active = self
            .targets
            .iter()
            .filter(|t| t.state() == TargetState::Requested && !t.is_finished())
            .count();

        for want_priority in [true, false] {
            for target in &mut self.targets {
                if active >= self.config.max_active_requests {
                    return;
                }
                if target.state() != TargetState::Queued || target.priority() != want_priority {
                    continue;
                }
                if target.send_request(wire) {
                    active += 1;
                } else {
                    target.complete(TransferCode::Error, &mut self.completions);
                }
            }
        }
    }

    fn sweep_senders(&mut self) {
        self.senders
            .retain(|s| s.status() != SenderStatus::Aborted && !(s.status() == SenderStatus::Complete && !s.awaiting_ack()));
    }

    fn sweep_targets(&mut self) {
        self.targets.retain(|t| !t.is_finished());
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Live outbound transfers (registered, pending, or in flight).
    pub fn send_count(&self) -> usize {
        self.senders.len()
    }

    /// Live inbound transfers.
    pub fn receive_count(&self) -> usize {
        self.targets.len()
    }

    /// Completion callbacks still waiting on the store.
    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }
}
