//! End-to-end transfers between two managers over an in-memory wire.
//!
//! Every message goes through its real encode/decode cycle, so these
//! tests exercise the framing layer as well as both state machines.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferry_protocol::{AssetKind, TransferMessage};
use ferry_store::{ContentStore, DirStore, StoreMode};
use ferry_transfer::{TransferConfig, TransferManager, TransferOutcome, Wire};
use tempfile::TempDir;
use uuid::Uuid;

/// Wire that queues encoded frames for the pump to deliver.
struct QueueWire {
    from: SocketAddr,
    queue: Arc<Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>>,
}

impl Wire for QueueWire {
    fn send(&mut self, peer: SocketAddr, message: &TransferMessage) -> bool {
        let frame = message.encode().expect("encode");
        self.queue
            .lock()
            .unwrap()
            .push_back((self.from, peer, frame));
        true
    }
}

struct Pair {
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    a: TransferManager,
    b: TransferManager,
    a_wire: QueueWire,
    b_wire: QueueWire,
    queue: Arc<Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>>,
}

impl Pair {
    fn new(a: TransferManager, b: TransferManager) -> Self {
        let a_addr: SocketAddr = "10.1.0.1:5000".parse().unwrap();
        let b_addr: SocketAddr = "10.1.0.2:5000".parse().unwrap();
        let queue: Arc<Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>> = Arc::default();
        let a_wire = QueueWire {
            from: a_addr,
            queue: Arc::clone(&queue),
        };
        let b_wire = QueueWire {
            from: b_addr,
            queue: Arc::clone(&queue),
        };
        Self {
            a_addr,
            b_addr,
            a,
            b,
            a_wire,
            b_wire,
            queue,
        }
    }

    /// Delivers queued frames until the network goes quiet. `mutate` can
    /// drop or duplicate frames to model an unreliable transport.
    fn pump_with(&mut self, mut mutate: impl FnMut(&TransferMessage) -> Vec<TransferMessage>) {
        for _ in 0..10_000 {
            let Some((from, to, frame)) = self.queue.lock().unwrap().pop_front() else {
                return;
            };
            let message = TransferMessage::decode(&frame).expect("decode");
            for delivered in mutate(&message) {
                if to == self.a_addr {
                    self.a.handle_message(&mut self.a_wire, from, delivered);
                } else if to == self.b_addr {
                    self.b.handle_message(&mut self.b_wire, from, delivered);
                } else {
                    panic!("frame for unknown address {to}");
                }
            }
        }
        panic!("network never went quiet");
    }

    fn pump(&mut self) {
        self.pump_with(|m| vec![m.clone()]);
    }
}

fn manager(root: &Path, store: Option<Arc<dyn ContentStore>>) -> TransferManager {
    let config = TransferConfig {
        files_root: root.to_path_buf(),
        ..TransferConfig::default()
    };
    TransferManager::new(config, store)
}

fn outcome_cell() -> (
    Arc<Mutex<Option<TransferOutcome>>>,
    Box<dyn FnOnce(TransferOutcome) + Send>,
) {
    let cell = Arc::new(Mutex::new(None));
    let c = Arc::clone(&cell);
    (cell, Box::new(move |o| *c.lock().unwrap() = Some(o)))
}

#[test]
fn memory_stream_lands_as_identical_file() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    // Serving peer parks the stream and tells the requester the id out
    // of band.
    let id = pair
        .a
        .register_memory_send(payload, Box::new(|outcome, _| assert!(outcome.is_success())));

    let out_path = b_root.path().join("received.bin");
    let (outcome, cb) = outcome_cell();
    pair.b
        .request_registered_file(&mut pair.b_wire, pair.a_addr, id, out_path.clone(), false, cb);

    pair.pump();

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::Success));
    assert_eq!(std::fs::read(&out_path).unwrap(), expected);
    assert_eq!(pair.a.send_count(), 0);
    assert_eq!(pair.b.receive_count(), 0);
}

#[test]
fn memory_stream_lands_back_in_memory() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let payload = b"short out-of-band handoff".to_vec();
    let expected = payload.clone();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let id = pair.a.register_memory_send(payload, Box::new(|_, _| {}));

    let received = Arc::new(Mutex::new(None));
    let r = Arc::clone(&received);
    pair.b.request_memory(
        &mut pair.b_wire,
        pair.a_addr,
        id,
        false,
        Box::new(move |outcome, data| {
            *r.lock().unwrap() = Some((outcome, data));
        }),
    );

    pair.pump();

    let got = received.lock().unwrap().take().unwrap();
    assert!(got.0.is_success());
    assert_eq!(got.1, expected);
}

#[test]
fn file_round_trip_deletes_served_temp() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let served = a_root.path().join("inventory_d8ab59d2.tmp");
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8).collect();
    std::fs::write(&served, &data).unwrap();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let out_path = b_root.path().join("fetched.bin");
    let (outcome, cb) = outcome_cell();
    pair.b.request_file(
        &mut pair.b_wire,
        pair.a_addr,
        out_path.clone(),
        "inventory_d8ab59d2.tmp",
        true, // delete the served temp once we have it
        false,
        false,
        cb,
    );

    pair.pump();

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::Success));
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
    assert!(!served.exists(), "served temp file must be consumed");
}

#[test]
fn missing_remote_file_reports_request_not_found() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let out_path = b_root.path().join("never.bin");
    let (outcome, cb) = outcome_cell();
    pair.b.request_file(
        &mut pair.b_wire,
        pair.a_addr,
        out_path.clone(),
        "no-such-file.bin",
        false,
        false,
        false,
        cb,
    );

    pair.pump();

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::RequestNotFound));
    assert!(!out_path.exists());
}

#[test]
fn traversal_request_is_denied_without_reading_anything() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();
    std::fs::write(a_root.path().join("secret"), b"keep out").unwrap();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let out_path = b_root.path().join("stolen");
    let (outcome, cb) = outcome_cell();
    pair.b.request_file(
        &mut pair.b_wire,
        pair.a_addr,
        out_path.clone(),
        "../secret",
        false,
        false,
        false,
        cb,
    );

    pair.pump();

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::PermissionDenied));
    assert!(!out_path.exists());
}

#[test]
fn asset_transfer_commits_into_receiving_store() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let a_store = Arc::new(DirStore::open(a_root.path().join("store")).unwrap());
    let b_store = Arc::new(DirStore::open(b_root.path().join("store")).unwrap());

    // Seed the serving store with an asset.
    let asset_id = Uuid::new_v4();
    let data: Vec<u8> = (0..30_000u32).map(|i| (i % 127) as u8).collect();
    {
        let w = a_store
            .open_staged(asset_id, AssetKind::Image, StoreMode::Write)
            .unwrap();
        a_store.write(w, &data).unwrap();
        a_store.close(w);
    }

    let mut pair = Pair::new(
        manager(a_root.path(), Some(Arc::clone(&a_store) as Arc<dyn ContentStore>)),
        manager(b_root.path(), Some(Arc::clone(&b_store) as Arc<dyn ContentStore>)),
    );

    let (outcome, cb) = outcome_cell();
    pair.b
        .request_asset(&mut pair.b_wire, pair.a_addr, asset_id, AssetKind::Image, false, true, cb)
        .unwrap();

    pair.pump();

    // The stream is done but the commit is asynchronous: the callback is
    // parked until a tick drains it.
    assert_eq!(*outcome.lock().unwrap(), None);
    assert_eq!(pair.b.pending_completions(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while pair.b.pending_completions() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
        pair.b.tick(&mut pair.b_wire);
    }

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::Success));
    assert!(b_store.contains(asset_id, AssetKind::Image));

    // Byte-for-byte identical on the receiving side.
    let r = b_store
        .open_staged(asset_id, AssetKind::Image, StoreMode::Read)
        .unwrap();
    let mut got = Vec::new();
    loop {
        let chunk = b_store.read(r, 8192).unwrap();
        if chunk.is_empty() {
            break;
        }
        got.extend_from_slice(&chunk);
    }
    b_store.close(r);
    assert_eq!(got, data);
}

#[test]
fn duplicated_frames_do_not_corrupt_the_stream() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 211) as u8).collect();
    std::fs::write(a_root.path().join("noisy.bin"), &data).unwrap();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let out_path = b_root.path().join("noisy-out.bin");
    let (outcome, cb) = outcome_cell();
    pair.b.request_file(
        &mut pair.b_wire,
        pair.a_addr,
        out_path.clone(),
        "noisy.bin",
        false,
        false,
        false,
        cb,
    );

    // A flaky transport that delivers every chunk twice. The duplicate is
    // re-confirmed but must not be consumed twice.
    pair.pump_with(|m| match m {
        TransferMessage::Chunk { .. } => vec![m.clone(), m.clone()],
        other => vec![other.clone()],
    });

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::Success));
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
}

#[test]
fn bulk_packets_negotiation_moves_bigger_chunks() {
    let a_root = TempDir::new().unwrap();
    let b_root = TempDir::new().unwrap();

    let data = vec![0x5A; 40_000];
    std::fs::write(a_root.path().join("bulk.bin"), &data).unwrap();

    let mut pair = Pair::new(manager(a_root.path(), None), manager(b_root.path(), None));

    let out_path = b_root.path().join("bulk-out.bin");
    let (outcome, cb) = outcome_cell();
    pair.b.request_file(
        &mut pair.b_wire,
        pair.a_addr,
        out_path.clone(),
        "bulk.bin",
        false,
        false,
        true, // bulk packets
        cb,
    );

    // Count chunk frames as they pass through.
    let chunk_frames = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&chunk_frames);
    pair.pump_with(move |m| {
        if matches!(m, TransferMessage::Chunk { .. }) {
            *counter.lock().unwrap() += 1;
        }
        vec![m.clone()]
    });

    assert_eq!(*outcome.lock().unwrap(), Some(TransferOutcome::Success));
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
    // 40_000 / 7680 -> 6 chunks rather than 40 at the small size.
    assert_eq!(*chunk_frames.lock().unwrap(), 6);
}
