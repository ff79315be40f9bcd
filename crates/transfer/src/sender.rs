//! Outbound stream packetization.
//!
//! A [`ChunkSender`] owns everything needed to push one stream to a peer:
//! a buffered byte window over the stream, the packet cursor, the ack
//! timer, and a small status machine. It knows nothing about *where*
//! bytes come from — that's the [`SourceBackend`]'s job — and nothing
//! about scheduling, which belongs to the manager.
//!
//! Flow control is the simplest thing that works: one chunk in flight,
//! advance on ack, resend on ack timeout, give up after a fixed retry
//! budget. Chunks are never reordered or pipelined.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ferry_protocol::{TransferMessage, packet};

use crate::source::SourceBackend;
use crate::{TransferCode, TransferError, Wire};

/// The sender's in-memory view of the stream: a contiguous run of bytes
/// starting at byte offset `start`, refilled from the backend as the
/// packet cursor advances past it.
#[derive(Debug)]
pub(crate) struct Window {
    buf: Vec<u8>,
    start: u64,
    contains_eof: bool,
    capacity: usize,
}

impl Window {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            contains_eof: false,
            capacity,
        }
    }

    pub(crate) fn reset(&mut self, start: u64) {
        self.buf.clear();
        self.start = start;
        self.contains_eof = false;
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn mark_eof(&mut self) {
        self.contains_eof = true;
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    /// Byte offset one past the last buffered byte.
    pub(crate) fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    pub(crate) fn contains_eof(&self) -> bool {
        self.contains_eof
    }

    /// Whether the stream offset falls inside the buffered run.
    pub(crate) fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Buffered bytes available at and after `offset`.
    pub(crate) fn available_from(&self, offset: u64) -> usize {
        self.end().saturating_sub(offset) as usize
    }

    /// Slice of `len` bytes at stream offset `offset`. Caller guarantees
    /// the range is buffered.
    pub(crate) fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let lo = (offset - self.start) as usize;
        &self.buf[lo..lo + len]
    }
}

/// Lifecycle of an outbound transfer. Transitions are monotonic;
/// `Complete` and `Aborted` are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    /// Created, backend not opened yet.
    Uninitialized,
    /// Parked until the peer requests the registered id.
    Registered,
    /// Requested and opened, waiting for a send slot.
    Pending,
    InProgress,
    Complete,
    Aborted,
}

impl SenderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SenderStatus::Complete | SenderStatus::Aborted)
    }
}

/// Packetization state for one outbound stream.
pub struct ChunkSender {
    id: u64,
    peer: Option<SocketAddr>,
    priority: bool,
    backend: SourceBackend,
    window: Window,
    chunk_size: usize,
    total_size: u64,
    /// Index of the last chunk handed to the wire; −1 before the first.
    packet_cursor: i64,
    status: SenderStatus,
    retry_count: u32,
    awaiting_ack: bool,
    ack_started: Instant,
    result: TransferCode,
    created: Instant,
}

impl ChunkSender {
    pub(crate) fn new(
        id: u64,
        backend: SourceBackend,
        chunk_size: usize,
        window_capacity: usize,
    ) -> Self {
        // Rounding the window to a whole number of chunks keeps every
        // refill on a chunk boundary, so a chunk never straddles the
        // window's end.
        let window_capacity = (window_capacity / chunk_size).max(1) * chunk_size;
        Self {
            id,
            peer: None,
            priority: false,
            backend,
            window: Window::new(window_capacity),
            chunk_size,
            total_size: 0,
            packet_cursor: -1,
            status: SenderStatus::Uninitialized,
            retry_count: 0,
            awaiting_ack: false,
            ack_started: Instant::now(),
            result: TransferCode::Ok,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn status(&self) -> SenderStatus {
        self.status
    }

    pub fn priority(&self) -> bool {
        self.priority
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn packet_cursor(&self) -> i64 {
        self.packet_cursor
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    pub fn result(&self) -> TransferCode {
        self.result
    }

    /// Time since the in-flight chunk went out.
    pub fn ack_elapsed(&self) -> Duration {
        self.ack_started.elapsed()
    }

    /// Time since the sender was created (registration timeout input).
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Declares the stream length and resets the window to the start.
    pub fn set_total_size(&mut self, n: u64) {
        self.total_size = n;
        self.window.reset(0);
    }

    /// Parks the sender awaiting a peer request for its id.
    pub(crate) fn mark_registered(&mut self) {
        self.status = SenderStatus::Registered;
        self.created = Instant::now();
    }

    /// Appends pushed bytes to the window, flushing through the backend
    /// when the window would overflow. A pure-memory backend cannot
    /// flush — the whole buffer must fit — and reports an error instead.
    pub fn receive_bytes(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if self.window.len() + bytes.len() > self.window.capacity() {
            self.backend.flush(&mut self.window)?;
        }
        self.window.push(bytes);
        Ok(())
    }

    /// Opens the backend and binds the transfer to the requesting peer.
    /// On success the sender is `Pending`, waiting for a send slot.
    pub(crate) fn start(
        &mut self,
        peer: SocketAddr,
        priority: bool,
        wire: &mut dyn Wire,
    ) -> Result<(), TransferCode> {
        self.peer = Some(peer);
        self.priority = priority;
        if self.status == SenderStatus::Uninitialized {
            match self.backend.open() {
                Ok(Some(size)) => self.set_total_size(size),
                Ok(None) => {}
                Err(e) => {
                    let code = e.as_code();
                    tracing::warn!(
                        id = format_args!("{:#018x}", self.id),
                        source = %self.backend.describe(),
                        "failed to open transfer source: {e}"
                    );
                    self.abort(code, wire);
                    return Err(code);
                }
            }
        }
        self.status = SenderStatus::Pending;
        Ok(())
    }

    /// Sends the chunk after the cursor and resets the retry budget.
    pub fn send_next_packet(&mut self, wire: &mut dyn Wire) {
        self.retry_count = 0;
        let next = (self.packet_cursor + 1) as u32;
        if let Err(e) = self.try_send_packet(next, wire) {
            self.abort_on_error(e, wire);
        }
    }

    /// Re-sends the chunk at the cursor (ack timed out) and bumps the
    /// retry count. The manager converts an exhausted budget into
    /// `abort(Timeout)`.
    pub fn resend_last_packet(&mut self, wire: &mut dyn Wire) {
        if self.packet_cursor < 0 {
            return;
        }
        self.retry_count += 1;
        let n = self.packet_cursor as u32;
        if let Err(e) = self.try_send_packet(n, wire) {
            self.abort_on_error(e, wire);
        }
    }

    fn try_send_packet(&mut self, n: u32, wire: &mut dyn Wire) -> Result<(), TransferError> {
        let offset = n as u64 * self.chunk_size as u64;
        if offset > self.total_size {
            // The backend reported a smaller stream than the cursor
            // implies; the slice length would go negative.
            return Err(TransferError::UnexpectedEof);
        }

        if !self.window.contains(offset) && !(self.window.contains_eof() && offset == self.window.end())
        {
            self.refill(offset)?;
        }

        let mut len = (self.total_size - offset).min(self.chunk_size as u64) as usize;
        let available = self.window.available_from(offset);
        if available < len {
            if self.window.contains_eof() {
                len = available;
            } else {
                return Err(TransferError::UnexpectedEof);
            }
        }

        let is_final = self.window.contains_eof() && offset + len as u64 >= self.total_size;
        if len == 0 && !is_final {
            return Err(TransferError::UnexpectedEof);
        }

        let data = self.window.slice(offset, len);
        // The receiver pre-allocates off packet 0's declared total size.
        let payload = if n == 0 {
            packet::prefix_total_size(self.total_size as u32, data)
        } else {
            data.to_vec()
        };

        let message = TransferMessage::Chunk {
            transfer_id: self.id,
            packet: packet::encode_packet_number(n, is_final)?,
            payload,
        };
        let peer = self
            .peer
            .ok_or(TransferError::InvalidState("send before start"))?;
        if !wire.send(peer, &message) {
            return Err(TransferError::CircuitGone);
        }

        tracing::debug!(
            id = format_args!("{:#018x}", self.id),
            packet = n,
            len,
            is_final,
            "sent chunk"
        );

        self.packet_cursor = n as i64;
        self.awaiting_ack = true;
        self.ack_started = Instant::now();
        self.status = if is_final {
            SenderStatus::Complete
        } else {
            SenderStatus::InProgress
        };
        Ok(())
    }

    /// Refills the window starting at `at`. Backends read sequentially,
    /// and sends are monotonic, so `at` is always the backend's position.
    fn refill(&mut self, at: u64) -> Result<(), TransferError> {
        self.window.reset(at);
        while self.window.len() < self.window.capacity() && !self.window.contains_eof() {
            let max = self.window.capacity() - self.window.len();
            let (bytes, is_final) = self.backend.produce(max)?;
            let got = bytes.len();
            self.window.push(&bytes);
            if is_final {
                self.window.mark_eof();
            } else if got == 0 {
                return Err(TransferError::UnexpectedEof);
            }
        }
        Ok(())
    }

    /// Records the peer's ack for the in-flight chunk.
    pub(crate) fn ack_received(&mut self) {
        self.awaiting_ack = false;
    }

    /// Aborts the transfer, telling the peer unless the transport is the
    /// thing that failed. Idempotent after the first terminal transition.
    pub fn abort(&mut self, code: TransferCode, wire: &mut dyn Wire) {
        self.abort_inner(code, Some(wire));
    }

    /// Aborts without a farewell message (peer-initiated abort, dead
    /// circuit, or no peer bound yet).
    pub(crate) fn abort_quiet(&mut self, code: TransferCode) {
        self.abort_inner(code, None);
    }

    fn abort_on_error(&mut self, e: TransferError, wire: &mut dyn Wire) {
        let code = e.as_code();
        tracing::warn!(
            id = format_args!("{:#018x}", self.id),
            source = %self.backend.describe(),
            "transfer failed: {e}"
        );
        if matches!(e, TransferError::CircuitGone) {
            self.abort_inner(code, None);
        } else {
            self.abort_inner(code, Some(wire));
        }
    }

    fn abort_inner(&mut self, code: TransferCode, wire: Option<&mut dyn Wire>) {
        // `Complete` is only settled once the final chunk's ack landed;
        // before that the transfer can still die of retry exhaustion.
        if self.status == SenderStatus::Aborted
            || (self.status == SenderStatus::Complete && !self.awaiting_ack)
        {
            return;
        }
        self.status = SenderStatus::Aborted;
        self.result = code;
        self.awaiting_ack = false;
        if let (Some(wire), Some(peer)) = (wire, self.peer) {
            let _ = wire.send(
                peer,
                &TransferMessage::Abort {
                    transfer_id: self.id,
                    result: code.to_wire(),
                },
            );
        }
        tracing::info!(
            id = format_args!("{:#018x}", self.id),
            source = %self.backend.describe(),
            ?code,
            "transfer aborted"
        );
        self.backend.close(code.outcome());
    }

    /// Final ack arrived: fires the completion callback with the
    /// accumulated result (success unless something already went wrong).
    pub(crate) fn complete(&mut self) {
        if self.status == SenderStatus::Aborted {
            return;
        }
        self.status = SenderStatus::Complete;
        if self.result == TransferCode::Ok {
            self.result = TransferCode::Done;
        }
        tracing::info!(
            id = format_args!("{:#018x}", self.id),
            bytes = self.total_size,
            "transfer complete"
        );
        self.backend.close(self.result.outcome());
    }
}

impl Drop for ChunkSender {
    fn drop(&mut self) {
        // A sender must be completed or aborted before it goes away;
        // dropping one with a live backend handle loses the caller's
        // completion callback.
        debug_assert!(
            !self.backend.has_open_handle(),
            "ChunkSender {:#018x} dropped with open backend handle",
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::packet::{decode_packet_number, is_final_packet, split_total_size};
    use std::sync::{Arc, Mutex};

    /// Wire stub capturing every message, optionally refusing to send.
    pub(crate) struct RecordingWire {
        pub sent: Vec<(SocketAddr, TransferMessage)>,
        pub alive: bool,
    }

    impl RecordingWire {
        pub(crate) fn new() -> Self {
            Self {
                sent: Vec::new(),
                alive: true,
            }
        }

        fn chunks(&self) -> Vec<(u32, Vec<u8>)> {
            self.sent
                .iter()
                .filter_map(|(_, m)| match m {
                    TransferMessage::Chunk {
                        packet, payload, ..
                    } => Some((*packet, payload.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    impl Wire for RecordingWire {
        fn send(&mut self, peer: SocketAddr, message: &TransferMessage) -> bool {
            if !self.alive {
                return false;
            }
            self.sent.push((peer, message.clone()));
            true
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4556".parse().unwrap()
    }

    fn memory_sender(data: Vec<u8>, chunk_size: usize) -> (ChunkSender, Arc<Mutex<Vec<TransferOutcomeRecord>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb_log = Arc::clone(&log);
        let total = data.len() as u64;
        let backend = SourceBackend::memory(
            data,
            Box::new(move |outcome, data| {
                cb_log.lock().unwrap().push(TransferOutcomeRecord {
                    outcome,
                    len: data.len(),
                });
            }),
        );
        let mut sender = ChunkSender::new(7, backend, chunk_size, 65536);
        sender.set_total_size(total);
        sender.mark_registered();
        (sender, log)
    }

    pub(crate) struct TransferOutcomeRecord {
        pub outcome: crate::TransferOutcome,
        pub len: usize,
    }

    fn start(sender: &mut ChunkSender, wire: &mut RecordingWire) {
        sender.start(peer(), false, wire).unwrap();
    }

    #[test]
    fn three_chunk_stream_with_final_bit() {
        // 2500 bytes at chunk size 1000: 1000, 1000, 500, final bit on #2.
        let data = vec![0xAB; 2500];
        let (mut sender, _log) = memory_sender(data, 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);

        sender.send_next_packet(&mut wire);
        assert!(sender.awaiting_ack());
        sender.ack_received();
        sender.send_next_packet(&mut wire);
        sender.ack_received();
        sender.send_next_packet(&mut wire);

        let chunks = wire.chunks();
        assert_eq!(chunks.len(), 3);

        // Packet 0 carries the 4-byte size prefix.
        let (total, body) = split_total_size(&chunks[0].1).unwrap();
        assert_eq!(total, 2500);
        assert_eq!(body.len(), 1000);

        assert_eq!(chunks[1].1.len(), 1000);
        assert_eq!(chunks[2].1.len(), 500);

        for (raw, _) in &chunks[..2] {
            assert!(!is_final_packet(*raw));
        }
        assert!(is_final_packet(chunks[2].0));
        assert_eq!(decode_packet_number(chunks[2].0), 2);
        assert_eq!(sender.status(), SenderStatus::Complete);

        sender.complete();
    }

    #[test]
    fn single_flight_never_two_unacked() {
        let (mut sender, _log) = memory_sender(vec![1; 5000], 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);

        sender.send_next_packet(&mut wire);
        let sent_before = wire.sent.len();
        assert!(sender.awaiting_ack());

        // Without an ack the only legal send is a resend of the same chunk.
        sender.resend_last_packet(&mut wire);
        assert_eq!(sender.packet_cursor(), 0);
        assert_eq!(sender.retry_count(), 1);
        assert_eq!(wire.sent.len(), sent_before + 1);
        let chunks = wire.chunks();
        assert_eq!(
            decode_packet_number(chunks[0].0),
            decode_packet_number(chunks[1].0)
        );

        sender.abort(TransferCode::Abort, &mut wire);
    }

    #[test]
    fn empty_stream_sends_one_final_packet() {
        let (mut sender, _log) = memory_sender(Vec::new(), 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);

        sender.send_next_packet(&mut wire);
        let chunks = wire.chunks();
        assert_eq!(chunks.len(), 1);
        assert!(is_final_packet(chunks[0].0));
        let (total, body) = split_total_size(&chunks[0].1).unwrap();
        assert_eq!(total, 0);
        assert!(body.is_empty());
        assert_eq!(sender.status(), SenderStatus::Complete);

        sender.complete();
    }

    #[test]
    fn window_refills_past_capacity() {
        // Stream larger than the window forces refills mid-transfer.
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let (mut sender, _log) = memory_sender(data, 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);

        let mut received = Vec::new();
        loop {
            sender.send_next_packet(&mut wire);
            let (raw, payload) = wire.chunks().last().unwrap().clone();
            let body = if decode_packet_number(raw) == 0 {
                split_total_size(&payload).unwrap().1.to_vec()
            } else {
                payload
            };
            received.extend_from_slice(&body);
            if is_final_packet(raw) {
                break;
            }
            sender.ack_received();
        }
        assert_eq!(received, expected);

        sender.complete();
    }

    #[test]
    fn completion_callback_carries_payload_once() {
        let (mut sender, log) = memory_sender(vec![9; 100], 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);
        sender.send_next_packet(&mut wire);
        sender.ack_received();
        sender.complete();
        sender.complete(); // second completion is a no-op

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].outcome.is_success());
        assert_eq!(log[0].len, 100);
    }

    #[test]
    fn abort_is_idempotent_and_sends_one_message() {
        let (mut sender, log) = memory_sender(vec![1; 100], 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);

        sender.abort(TransferCode::Abort, &mut wire);
        sender.abort(TransferCode::Error, &mut wire);

        let aborts: Vec<_> = wire
            .sent
            .iter()
            .filter(|(_, m)| matches!(m, TransferMessage::Abort { .. }))
            .collect();
        assert_eq!(aborts.len(), 1);
        assert_eq!(sender.result(), TransferCode::Abort);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(!log[0].outcome.is_success());
    }

    #[test]
    fn dead_circuit_suppresses_abort_message() {
        let (mut sender, log) = memory_sender(vec![1; 100], 1000);
        let mut wire = RecordingWire::new();
        start(&mut sender, &mut wire);
        wire.alive = false;

        sender.send_next_packet(&mut wire);

        assert_eq!(sender.status(), SenderStatus::Aborted);
        assert!(wire.sent.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn receive_bytes_overflow_errors_on_memory_backend() {
        let (mut sender, _log) = memory_sender(Vec::new(), 1000);
        // Tiny window so the second push overflows.
        sender.window = Window::new(8);
        sender.receive_bytes(&[0; 8]).unwrap();
        let err = sender.receive_bytes(&[0; 1]);
        assert!(matches!(err, Err(TransferError::InvalidState(_))));
        sender.abort_quiet(TransferCode::Abort);
    }

    #[test]
    fn window_slicing() {
        let mut w = Window::new(16);
        w.reset(100);
        w.push(b"abcdef");
        assert_eq!(w.start(), 100);
        assert_eq!(w.end(), 106);
        assert!(w.contains(100));
        assert!(w.contains(105));
        assert!(!w.contains(106));
        assert_eq!(w.available_from(103), 3);
        assert_eq!(w.slice(102, 3), b"cde");
    }
}
