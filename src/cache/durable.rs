//! Durable derivative tier.
//!
//! The storage technology sits behind [`DurableStore`]. The cache never talks
//! to a store directly: every operation goes through a [`DurableTier`], which
//! applies them one at a time in submission order on a background task. A
//! delete issued by an invalidation can therefore never be overtaken by an
//! older write, nor can a later read observe the value it deleted.

use crate::error::StorageError;
use crate::state::EditFingerprint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Async key -> bytes store that survives process restarts.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Short name used in log messages.
    fn name(&self) -> &'static str;
}

/// Process-local store. Survives service restarts within one process, which
/// is what tests and ephemeral sessions need.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Task("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.lock()?.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

const RECORD_MAGIC: &[u8; 4] = b"RTD1";
const FLAG_ORIGINAL: u8 = 0;
const FLAG_EDITED: u8 = 1;

/// A derivative as persisted: the edit identity it was rendered with plus
/// the encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDerivative {
    pub edit: Option<EditFingerprint>,
    pub bytes: Vec<u8>,
}

impl StoredDerivative {
    /// `RTD1 | flag | [fingerprint] | payload`
    pub fn encode(edit: Option<EditFingerprint>, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 5 + EditFingerprint::LEN);
        out.extend_from_slice(RECORD_MAGIC);
        match edit {
            Some(fp) => {
                out.push(FLAG_EDITED);
                out.extend_from_slice(fp.as_bytes());
            }
            None => out.push(FLAG_ORIGINAL),
        }
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(key: &str, mut record: Vec<u8>) -> Result<Self, StorageError> {
        let corrupt = || StorageError::Corrupt(key.to_string());
        if record.len() < 5 || &record[..4] != RECORD_MAGIC {
            return Err(corrupt());
        }
        let (edit, header_len) = match record[4] {
            FLAG_ORIGINAL => (None, 5),
            FLAG_EDITED => {
                let end = 5 + EditFingerprint::LEN;
                let fp: [u8; 16] = record
                    .get(5..end)
                    .ok_or_else(corrupt)?
                    .try_into()
                    .map_err(|_| corrupt())?;
                (Some(EditFingerprint::from_bytes(fp)), end)
            }
            _ => return Err(corrupt()),
        };
        record.drain(..header_len);
        Ok(Self {
            edit,
            bytes: record,
        })
    }
}

enum DurableOp {
    Get {
        key: String,
        reply: oneshot::Sender<Option<StoredDerivative>>,
    },
    Set {
        key: String,
        record: Vec<u8>,
    },
    Delete {
        key: String,
    },
    Clear,
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Ordered, best-effort front for a [`DurableStore`].
///
/// Writes are fire-and-forget. Failures are logged and turn into misses;
/// they never reach the caller.
#[derive(Clone)]
pub struct DurableTier {
    tx: mpsc::UnboundedSender<DurableOp>,
}

impl DurableTier {
    /// Start the background task on the current tokio runtime.
    ///
    /// The task exits once every clone of the tier has been dropped.
    pub fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_durable_ops(store, rx));
        Self { tx }
    }

    fn send(&self, op: DurableOp) {
        if self.tx.send(op).is_err() {
            debug!("durable tier closed, dropping operation");
        }
    }

    /// Read a record; any storage failure reads as a miss.
    pub async fn get(&self, key: &str) -> Option<StoredDerivative> {
        let (reply, rx) = oneshot::channel();
        self.send(DurableOp::Get {
            key: key.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    pub fn set(&self, key: &str, edit: Option<EditFingerprint>, payload: &[u8]) {
        self.send(DurableOp::Set {
            key: key.to_string(),
            record: StoredDerivative::encode(edit, payload),
        });
    }

    pub fn delete(&self, key: &str) {
        self.send(DurableOp::Delete {
            key: key.to_string(),
        });
    }

    pub fn clear(&self) {
        self.send(DurableOp::Clear);
    }

    /// Wait until every operation submitted before this call has been applied.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(DurableOp::Flush { reply });
        let _ = rx.await;
    }
}

async fn run_durable_ops(store: Arc<dyn DurableStore>, mut rx: mpsc::UnboundedReceiver<DurableOp>) {
    let name = store.name();
    while let Some(op) = rx.recv().await {
        match op {
            DurableOp::Get { key, reply } => {
                let value = read_record(store.as_ref(), &key).await;
                let _ = reply.send(value);
            }
            DurableOp::Set { key, record } => {
                if let Err(e) = store.set(&key, &record).await {
                    warn!(store = name, key = %key, error = %e, "durable write skipped");
                }
            }
            DurableOp::Delete { key } => {
                if let Err(e) = store.delete(&key).await {
                    warn!(store = name, key = %key, error = %e, "durable delete failed");
                }
            }
            DurableOp::Clear => {
                if let Err(e) = store.clear().await {
                    warn!(store = name, error = %e, "durable clear failed");
                }
            }
            DurableOp::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!(store = name, "durable tier stopped");
}

/// Read and decode one record. A corrupt record is deleted here, before the
/// next queued operation runs, so the cleanup cannot remove a newer write.
async fn read_record(store: &dyn DurableStore, key: &str) -> Option<StoredDerivative> {
    let name = store.name();
    let record = match store.get(key).await {
        Ok(record) => record?,
        Err(e) => {
            warn!(store = name, key, error = %e, "durable read failed, treating as miss");
            return None;
        }
    };
    match StoredDerivative::decode(key, record) {
        Ok(stored) => Some(stored),
        Err(e) => {
            warn!(store = name, key, error = %e, "discarding unreadable durable record");
            if let Err(e) = store.delete(key).await {
                warn!(store = name, key, error = %e, "durable delete failed");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EditParams;

    #[test]
    fn test_record_keeps_edit_identity() {
        let fp = EditParams {
            exposure: 0.7,
            ..EditParams::default()
        }
        .fingerprint();

        let original = StoredDerivative::decode("a", StoredDerivative::encode(None, b"jpeg")).unwrap();
        assert_eq!(original.edit, None);
        assert_eq!(original.bytes, b"jpeg");

        let edited = StoredDerivative::decode("a", StoredDerivative::encode(Some(fp), b"jpeg")).unwrap();
        assert_eq!(edited.edit, Some(fp));
        assert_eq!(edited.bytes, b"jpeg");
    }

    #[test]
    fn test_foreign_bytes_are_corrupt() {
        assert!(matches!(
            StoredDerivative::decode("a", vec![0xFF, 0xD8, 0xFF, 0xD9, 0x00]),
            Err(StorageError::Corrupt(key)) if key == "a"
        ));
        let mut truncated = StoredDerivative::encode(Some(EditParams::default().fingerprint()), b"");
        truncated.truncate(10);
        assert!(StoredDerivative::decode("a", truncated).is_err());
    }

    #[tokio::test]
    async fn test_tier_applies_operations_in_order() {
        let store = MemoryStore::new();
        let tier = DurableTier::spawn(Arc::new(store.clone()));

        tier.set("a", None, b"first");
        tier.delete("a");
        assert!(tier.get("a").await.is_none());

        tier.set("a", None, b"second");
        assert_eq!(tier.get("a").await.unwrap().bytes, b"second");

        tier.clear();
        tier.flush().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_miss_and_is_removed() {
        let store = MemoryStore::new();
        store.set("a", b"not a record").await.unwrap();
        let tier = DurableTier::spawn(Arc::new(store.clone()));

        assert!(tier.get("a").await.is_none());
        tier.flush().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_cleanup_keeps_later_write() {
        let store = MemoryStore::new();
        store.set("a", b"not a record").await.unwrap();
        let tier = DurableTier::spawn(Arc::new(store.clone()));

        // Queue the read, let the tier answer it, then write before the
        // reader wakes up.
        let reader = tier.clone();
        let read = tokio::spawn(async move { reader.get("a").await });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        tier.set("a", None, b"fresh");

        assert!(read.await.unwrap().is_none());
        tier.flush().await;
        let stored = tier.get("a").await.unwrap();
        assert_eq!(stored.bytes, b"fresh");
    }
}
