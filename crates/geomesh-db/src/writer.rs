//! Ordered background writes to a [`RecordStore`].
//!
//! The in-memory registries write through without waiting on SQLite. Every
//! save and delete goes onto one queue drained by a single worker thread,
//! so writes for a key land in the order they were issued and a delete can
//! never be overtaken by an earlier save.

use crate::store::RecordStore;
use geomesh_types::JsonMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum WriteOp {
    Save {
        kind: &'static str,
        id: String,
        fields: JsonMap,
    },
    Delete {
        kind: &'static str,
        id: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the write queue. Clones share the queue and its worker; the
/// worker exits once every handle is dropped.
#[derive(Clone)]
pub struct RecordWriter {
    store: Arc<dyn RecordStore>,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl RecordWriter {
    /// Starts the worker thread for `store`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(store: Arc<dyn RecordStore>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_store = Arc::clone(&store);
        std::thread::Builder::new()
            .name("geomesh-record-writer".into())
            .spawn(move || drain(worker_store.as_ref(), rx))?;
        Ok(Self { store, tx })
    }

    /// The store writes are applied to, for direct reads.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn save(&self, kind: &'static str, id: impl Into<String>, fields: JsonMap) {
        self.enqueue(WriteOp::Save {
            kind,
            id: id.into(),
            fields,
        });
    }

    pub fn delete(&self, kind: &'static str, id: impl Into<String>) {
        self.enqueue(WriteOp::Delete { kind, id: id.into() });
    }

    /// Resolves once every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        self.enqueue(WriteOp::Flush(done));
        // A dropped sender means the worker is gone; nothing is left to wait on.
        let _ = applied.await;
    }

    fn enqueue(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            tracing::error!("record writer stopped, dropping write");
        }
    }
}

fn drain(store: &dyn RecordStore, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Save { kind, id, fields } => {
                if let Err(e) = store.save(kind, &id, &fields) {
                    tracing::warn!(kind, id = %id, error = %e, "failed to persist record");
                }
            }
            WriteOp::Delete { kind, id } => {
                if let Err(e) = store.delete(kind, &id) {
                    tracing::warn!(kind, id = %id, error = %e, "failed to delete persisted record");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("record writer drained");
}
