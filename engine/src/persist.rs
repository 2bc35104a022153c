//! Durable storage of libraries, documents, and chunks.
//!
//! Document-oriented contract with three logical collections keyed by id.
//! Writes are single-record upserts; there is no global transaction. The
//! adapter is pluggable: `MemoryStorage` backs tests, `FileStorage` is the
//! durable directory store (one JSON record per file, atomic temp + rename).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EngineError, Result};
use crate::schema::{Chunk, Document, Library};

/// Version tag written into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

/// Per-record envelope; rejected on version mismatch at load.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema: u32,
    record: T,
}

/// Full persisted state, grouped the way recovery consumes it.
#[derive(Debug, Default)]
pub struct StorageSnapshot {
    pub libraries: Vec<Library>,
    pub documents_by_library: HashMap<String, Vec<Document>>,
    pub chunks_by_library: HashMap<String, Vec<Chunk>>,
}

/// Pluggable persistence adapter.
///
/// `delete_library` and `delete_document` cascade to their children inside
/// the adapter, so the caller issues one delete per entity it removes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn save_library(&self, library: &Library) -> Result<()>;
    async fn save_document(&self, document: &Document) -> Result<()>;
    async fn save_chunk(&self, chunk: &Chunk) -> Result<()>;

    async fn delete_library(&self, id: &str) -> Result<()>;
    async fn delete_document(&self, id: &str) -> Result<()>;
    async fn delete_chunk(&self, id: &str) -> Result<()>;
    async fn delete_chunks_for_library(&self, library_id: &str) -> Result<()>;

    /// Snapshot of everything, used once at startup.
    async fn load_all(&self) -> Result<StorageSnapshot>;
}

// ============================================================================
// In-memory backend (tests, TEST_MODE)
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    libraries: HashMap<String, Library>,
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
}

/// Map-backed storage with optional write-failure injection so rollback
/// paths can be exercised.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every subsequent write or delete fails with Upstream.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Upstream("storage write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save_library(&self, library: &Library) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .libraries
            .insert(library.id.clone(), library.clone());
        Ok(())
    }

    async fn save_document(&self, document: &Document) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn save_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .chunks
            .insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn delete_library(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.libraries.remove(id);
        inner.documents.retain(|_, d| d.library_id != id);
        inner.chunks.retain(|_, c| c.library_id != id);
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.documents.remove(id);
        inner.chunks.retain(|_, c| c.document_id != id);
        Ok(())
    }

    async fn delete_chunk(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().chunks.remove(id);
        Ok(())
    }

    async fn delete_chunks_for_library(&self, library_id: &str) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .chunks
            .retain(|_, c| c.library_id != library_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<StorageSnapshot> {
        let inner = self.inner.lock();
        let mut snapshot = StorageSnapshot {
            libraries: inner.libraries.values().cloned().collect(),
            ..Default::default()
        };
        for doc in inner.documents.values() {
            snapshot
                .documents_by_library
                .entry(doc.library_id.clone())
                .or_default()
                .push(doc.clone());
        }
        for chunk in inner.chunks.values() {
            snapshot
                .chunks_by_library
                .entry(chunk.library_id.clone())
                .or_default()
                .push(chunk.clone());
        }
        Ok(snapshot)
    }
}

// ============================================================================
// File-backed backend
// ============================================================================

/// Directory store: `libraries/`, `documents/`, `chunks/` with one JSON
/// record per file. Writes go to a temp file first, then rename (atomic on
/// POSIX), the same idiom used for snapshot and manifest files elsewhere in
/// this codebase's lineage.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["libraries", "documents", "chunks"] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| EngineError::Upstream(format!("create {dir} dir: {e}")))?;
        }
        Ok(Self { root })
    }

    fn record_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    async fn write_record<T: Serialize>(&self, collection: &str, id: &str, record: &T) -> Result<()> {
        let envelope = Envelope {
            schema: SCHEMA_VERSION,
            record,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| EngineError::Upstream(format!("serialize {collection}/{id}: {e}")))?;

        let path = self.record_path(collection, id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| EngineError::Upstream(format!("write {collection}/{id}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::Upstream(format!("rename {collection}/{id}: {e}")))?;
        Ok(())
    }

    async fn remove_record(&self, collection: &str, id: &str) -> Result<()> {
        let path = self.record_path(collection, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Upstream(format!(
                "delete {collection}/{id}: {e}"
            ))),
        }
    }

    async fn read_records<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let dir = self.root.join(collection);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| EngineError::Upstream(format!("read {collection} dir: {e}")))?;
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Upstream(format!("scan {collection} dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| EngineError::Upstream(format!("read {}: {e}", path.display())))?;
            let envelope: Envelope<T> = serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Upstream(format!("parse {}: {e}", path.display())))?;
            if envelope.schema != SCHEMA_VERSION {
                return Err(EngineError::Upstream(format!(
                    "unsupported schema version {} in {}",
                    envelope.schema,
                    path.display()
                )));
            }
            records.push(envelope.record);
        }
        Ok(records)
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn save_library(&self, library: &Library) -> Result<()> {
        self.write_record("libraries", &library.id, library).await
    }

    async fn save_document(&self, document: &Document) -> Result<()> {
        self.write_record("documents", &document.id, document).await
    }

    async fn save_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.write_record("chunks", &chunk.id, chunk).await
    }

    async fn delete_library(&self, id: &str) -> Result<()> {
        self.remove_record("libraries", id).await?;
        for doc in self.read_records::<Document>("documents").await? {
            if doc.library_id == id {
                self.remove_record("documents", &doc.id).await?;
            }
        }
        self.delete_chunks_for_library(id).await
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.remove_record("documents", id).await?;
        for chunk in self.read_records::<Chunk>("chunks").await? {
            if chunk.document_id == id {
                self.remove_record("chunks", &chunk.id).await?;
            }
        }
        Ok(())
    }

    async fn delete_chunk(&self, id: &str) -> Result<()> {
        self.remove_record("chunks", id).await
    }

    async fn delete_chunks_for_library(&self, library_id: &str) -> Result<()> {
        for chunk in self.read_records::<Chunk>("chunks").await? {
            if chunk.library_id == library_id {
                self.remove_record("chunks", &chunk.id).await?;
            }
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<StorageSnapshot> {
        let mut snapshot = StorageSnapshot {
            libraries: self.read_records("libraries").await?,
            ..Default::default()
        };
        for doc in self.read_records::<Document>("documents").await? {
            snapshot
                .documents_by_library
                .entry(doc.library_id.clone())
                .or_default()
                .push(doc);
        }
        for chunk in self.read_records::<Chunk>("chunks").await? {
            snapshot
                .chunks_by_library
                .entry(chunk.library_id.clone())
                .or_default()
                .push(chunk);
        }
        Ok(snapshot)
    }
}
