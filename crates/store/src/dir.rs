//! Directory-backed [`ContentStore`] with a commit worker thread.
//!
//! Entries live as `<uuid>.<kind-extension>` files under one root
//! directory. Reads and writes happen inline on the caller's thread;
//! renames are queued to a dedicated worker so a slow disk never stalls
//! the protocol thread. Rename status is kept in a shared map the caller
//! polls through [`ContentStore::query_status`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ferry_protocol::AssetKind;
use uuid::Uuid;

use crate::{AsyncOpStatus, ContentStore, RenameHandle, StoreError, StoreHandle, StoreMode};

struct OpenEntry {
    file: File,
    mode: StoreMode,
    size: u64,
    max_size: Option<u64>,
    written: u64,
}

enum WorkerCmd {
    Rename {
        op: u64,
        from: PathBuf,
        to: PathBuf,
        auto_delete: bool,
    },
    Shutdown,
}

/// A [`ContentStore`] keeping entries as flat files under a root directory.
pub struct DirStore {
    root: PathBuf,
    handles: Mutex<HashMap<u64, OpenEntry>>,
    next_handle: AtomicU64,
    ops: Arc<Mutex<HashMap<u64, AsyncOpStatus>>>,
    next_op: AtomicU64,
    worker_tx: Mutex<Option<Sender<WorkerCmd>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DirStore {
    /// Opens (creating if needed) a store rooted at `root` and starts the
    /// commit worker.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let ops: Arc<Mutex<HashMap<u64, AsyncOpStatus>>> = Arc::default();
        let (tx, rx) = mpsc::channel::<WorkerCmd>();

        let worker_ops = Arc::clone(&ops);
        let worker = std::thread::Builder::new()
            .name("ferry-store-commit".into())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        WorkerCmd::Rename {
                            op,
                            from,
                            to,
                            auto_delete,
                        } => {
                            let result = if auto_delete {
                                fs::rename(&from, &to)
                            } else {
                                fs::copy(&from, &to).map(|_| ())
                            };
                            let status = match result {
                                Ok(()) => AsyncOpStatus::Complete,
                                Err(e) => {
                                    tracing::warn!(
                                        from = %from.display(),
                                        to = %to.display(),
                                        "store commit failed: {e}"
                                    );
                                    AsyncOpStatus::Expired
                                }
                            };
                            worker_ops.lock().unwrap().insert(op, status);
                        }
                        WorkerCmd::Shutdown => break,
                    }
                }
            })?;

        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            ops,
            next_op: AtomicU64::new(1),
            worker_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops the commit worker, finishing any queued renames first.
    pub fn shutdown(&self) {
        let tx = self.worker_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(WorkerCmd::Shutdown);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    /// Path of the entry `(id, kind)` under this store's root.
    pub fn entry_path(&self, id: Uuid, kind: AssetKind) -> PathBuf {
        entry_path(&self.root, id, kind)
    }

    /// Returns `true` if the entry exists on disk.
    pub fn contains(&self, id: Uuid, kind: AssetKind) -> bool {
        self.entry_path(id, kind).exists()
    }
}

fn entry_path(root: &Path, id: Uuid, kind: AssetKind) -> PathBuf {
    root.join(format!("{id}.{}", kind.extension()))
}

impl ContentStore for DirStore {
    fn open_staged(
        &self,
        id: Uuid,
        kind: AssetKind,
        mode: StoreMode,
    ) -> Result<StoreHandle, StoreError> {
        let path = self.entry_path(id, kind);
        let (file, size) = match mode {
            StoreMode::Read => {
                let file = File::open(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StoreError::NotFound { id, kind }
                    } else {
                        StoreError::Io(e)
                    }
                })?;
                let size = file.metadata()?.len();
                (file, size)
            }
            StoreMode::Write => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)?;
                (file, 0)
            }
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(
            handle,
            OpenEntry {
                file,
                mode,
                size,
                max_size: None,
                written: 0,
            },
        );
        Ok(StoreHandle(handle))
    }

    fn set_max_size(&self, handle: StoreHandle, max: u64) -> Result<(), StoreError> {
        let mut handles = self.handles.lock().unwrap();
        let entry = handles.get_mut(&handle.0).ok_or(StoreError::BadHandle)?;
        if entry.mode != StoreMode::Write {
            return Err(StoreError::ReadOnly);
        }
        entry.max_size = Some(max);
        Ok(())
    }

    fn write(&self, handle: StoreHandle, data: &[u8]) -> Result<(), StoreError> {
        let mut handles = self.handles.lock().unwrap();
        let entry = handles.get_mut(&handle.0).ok_or(StoreError::BadHandle)?;
        if entry.mode != StoreMode::Write {
            return Err(StoreError::ReadOnly);
        }
        if let Some(max) = entry.max_size
            && entry.written + data.len() as u64 > max
        {
            return Err(StoreError::MaxSizeExceeded { max });
        }
        entry.file.write_all(data)?;
        entry.written += data.len() as u64;
        Ok(())
    }

    fn read(&self, handle: StoreHandle, max: usize) -> Result<Vec<u8>, StoreError> {
        let mut handles = self.handles.lock().unwrap();
        let entry = handles.get_mut(&handle.0).ok_or(StoreError::BadHandle)?;
        let mut buf = vec![0u8; max];
        let n = entry.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn size(&self, handle: StoreHandle) -> Result<u64, StoreError> {
        let handles = self.handles.lock().unwrap();
        let entry = handles.get(&handle.0).ok_or(StoreError::BadHandle)?;
        Ok(match entry.mode {
            StoreMode::Read => entry.size,
            StoreMode::Write => entry.written,
        })
    }

    fn close(&self, handle: StoreHandle) {
        self.handles.lock().unwrap().remove(&handle.0);
    }

    fn remove(&self, id: Uuid, kind: AssetKind) -> Result<(), StoreError> {
        fs::remove_file(self.entry_path(id, kind)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound { id, kind }
            } else {
                StoreError::Io(e)
            }
        })
    }

    fn rename_async(
        &self,
        from: (Uuid, AssetKind),
        to: (Uuid, AssetKind),
        auto_delete: bool,
    ) -> RenameHandle {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.ops.lock().unwrap().insert(op, AsyncOpStatus::Pending);

        let tx = self.worker_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                let cmd = WorkerCmd::Rename {
                    op,
                    from: self.entry_path(from.0, from.1),
                    to: self.entry_path(to.0, to.1),
                    auto_delete,
                };
                if tx.send(cmd).is_err() {
                    self.ops.lock().unwrap().insert(op, AsyncOpStatus::Expired);
                }
            }
            // Shutdown already happened; the op can never complete.
            None => {
                self.ops.lock().unwrap().insert(op, AsyncOpStatus::Expired);
            }
        }
        RenameHandle(op)
    }

    fn query_status(&self, handle: RenameHandle) -> AsyncOpStatus {
        self.ops
            .lock()
            .unwrap()
            .get(&handle.0)
            .copied()
            .unwrap_or(AsyncOpStatus::Expired)
    }
}

impl Drop for DirStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
