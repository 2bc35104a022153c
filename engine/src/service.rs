//! Service facade: CRUD, search, train, and rebuild with locking and
//! persistence.
//!
//! Write path: acquire the library writer lock, mutate the entity maps,
//! apply the index delta, persist, release. A persistence failure poisons
//! the operation: the in-memory change is rolled back before the lock is
//! released so invariants hold under restart. Read path: reader lock,
//! consult the index, resolve ids back to chunks.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::index::{build_index, IndexKind, IndexParams};
use crate::metrics;
use crate::schema::{Chunk, Document, Library, LibraryStats, SearchResult, MAX_DIMS};
use crate::store::{LibraryHandle, LibraryState, LibraryStore};
use crate::persist::StorageBackend;
use crate::vector;

/// Search `k` is clamped into this range at the store boundary.
const MAX_SEARCH_K: usize = 1000;

/// Chunk fields accepted by create and batch-create.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChunk {
    pub document_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Partial update for a chunk; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkPatch {
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Partial update for a document. `library_id` is immutable; a patch that
/// names it is rejected with Conflict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub library_id: Option<String>,
}

/// Partial update for a library. `dims` and `index_type` are immutable; a
/// patch that names either is rejected with Conflict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibraryPatch {
    pub name: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub dims: Option<usize>,
    pub index_type: Option<String>,
}

/// Orchestrates the library store, the per-library indexes, and the
/// persistence adapter.
pub struct VectorDbService {
    store: LibraryStore,
    storage: Arc<dyn StorageBackend>,
}

impl VectorDbService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            store: LibraryStore::new(),
            storage,
        }
    }

    /// Wrap a store that recovery has already populated.
    pub fn with_store(store: LibraryStore, storage: Arc<dyn StorageBackend>) -> Self {
        Self { store, storage }
    }

    /// Guards against operating on a handle that lost the race with a
    /// concurrent library delete: the lock was acquired, but the handle is
    /// no longer the installed one.
    fn verify_installed(&self, handle: &Arc<LibraryHandle>) -> Result<()> {
        match self.store.get(&handle.id) {
            Some(current) if Arc::ptr_eq(&current, handle) => Ok(()),
            _ => Err(EngineError::NotFound(format!("library {}", handle.id))),
        }
    }

    fn handle(&self, library_id: &str) -> Result<Arc<LibraryHandle>> {
        self.store
            .get(library_id)
            .ok_or_else(|| EngineError::NotFound(format!("library {library_id}")))
    }

    fn validate_embedding(dims: usize, embedding: &[f32]) -> Result<()> {
        if embedding.len() != dims {
            return Err(EngineError::Validation(format!(
                "dim mismatch: expected {dims}, got {}",
                embedding.len()
            )));
        }
        if !vector::is_finite(embedding) {
            return Err(EngineError::Validation(
                "embedding contains non-finite values".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Libraries
    // ========================================================================

    pub async fn create_library(
        &self,
        name: String,
        dims: usize,
        index_type: &str,
        index_params: Option<&serde_json::Value>,
        metadata: HashMap<String, String>,
    ) -> Result<Library> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("library name must not be empty".into()));
        }
        if dims < 1 || dims > MAX_DIMS {
            return Err(EngineError::Validation(format!(
                "dims must be in [1, {MAX_DIMS}]"
            )));
        }
        let params = IndexParams::from_request(index_type, index_params)?;
        let library = Library::new(name, dims, params.kind(), params, metadata);

        // Persist before installing: nothing in memory to roll back.
        self.storage.save_library(&library).await?;
        self.store
            .insert(LibraryHandle::new(LibraryState::new(library.clone())));
        metrics::MUTATIONS_TOTAL.inc();
        info!(library_id = %library.id, op = "create_library", kind = %library.index_kind, "library created");
        Ok(library)
    }

    pub async fn list_libraries(&self) -> Vec<Library> {
        let mut libraries = Vec::new();
        for handle in self.store.all() {
            let state = handle.state.read().await;
            libraries.push(state.library.clone());
        }
        libraries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        libraries
    }

    pub async fn get_library(&self, library_id: &str) -> Result<Library> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        Ok(state.library.clone())
    }

    pub async fn update_library(&self, library_id: &str, patch: LibraryPatch) -> Result<Library> {
        if patch.dims.is_some() || patch.index_type.is_some() {
            return Err(EngineError::Conflict(
                "dims and index_type are immutable after creation".into(),
            ));
        }
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(EngineError::Validation("library name must not be empty".into()));
            }
        }

        let previous = state.library.clone();
        if let Some(name) = patch.name {
            state.library.name = name;
        }
        if let Some(metadata) = patch.metadata {
            state.library.metadata = metadata;
        }
        state.library.touch();

        if let Err(e) = self.storage.save_library(&state.library).await {
            warn!(library_id, op = "update_library", kind = e.kind(), "rolled back after persistence failure");
            state.library = previous;
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(state.library.clone())
    }

    pub async fn delete_library(&self, library_id: &str) -> Result<()> {
        let handle = self.handle(library_id)?;
        // Serialize with in-flight writers before tearing down.
        let state = handle.state.write().await;
        self.verify_installed(&handle)?;
        self.storage.delete_library(library_id).await?;
        self.store.remove(library_id);
        drop(state);
        metrics::MUTATIONS_TOTAL.inc();
        info!(library_id, op = "delete_library", "library deleted");
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    pub async fn create_document(
        &self,
        library_id: &str,
        title: String,
        metadata: HashMap<String, String>,
    ) -> Result<Document> {
        if title.trim().is_empty() {
            return Err(EngineError::Validation("document title must not be empty".into()));
        }
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let document = Document::new(library_id.to_string(), title, metadata);
        state
            .documents
            .insert(document.id.clone(), document.clone());

        if let Err(e) = self.storage.save_document(&document).await {
            warn!(library_id, op = "create_document", kind = e.kind(), "rolled back after persistence failure");
            state.documents.remove(&document.id);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(document)
    }

    pub async fn list_documents(&self, library_id: &str) -> Result<Vec<Document>> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        let mut documents: Vec<Document> = state.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(documents)
    }

    pub async fn get_document(&self, library_id: &str, document_id: &str) -> Result<Document> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        state
            .documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))
    }

    pub async fn update_document(
        &self,
        library_id: &str,
        document_id: &str,
        patch: DocumentPatch,
    ) -> Result<Document> {
        if patch.library_id.is_some() {
            return Err(EngineError::Conflict(
                "a document cannot move between libraries".into(),
            ));
        }
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let previous = state
            .documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(EngineError::Validation("document title must not be empty".into()));
            }
        }

        let updated = {
            let doc = state
                .documents
                .get_mut(document_id)
                .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;
            if let Some(title) = patch.title {
                doc.title = title;
            }
            if let Some(metadata) = patch.metadata {
                doc.metadata = metadata;
            }
            doc.touch();
            doc.clone()
        };

        if let Err(e) = self.storage.save_document(&updated).await {
            warn!(library_id, op = "update_document", kind = e.kind(), "rolled back after persistence failure");
            state.documents.insert(document_id.to_string(), previous);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(updated)
    }

    /// Delete a document and cascade to its chunks, in the entity maps, the
    /// index, and storage.
    pub async fn delete_document(&self, library_id: &str, document_id: &str) -> Result<()> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let document = state
            .documents
            .remove(document_id)
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;

        let removed_ids: Vec<String> = state
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        let mut removed_chunks = Vec::with_capacity(removed_ids.len());
        for id in &removed_ids {
            if let Some(chunk) = state.chunks.remove(id) {
                state.index.remove(id);
                removed_chunks.push(chunk);
            }
        }

        if let Err(e) = self.storage.delete_document(document_id).await {
            warn!(library_id, op = "delete_document", kind = e.kind(), "rolled back after persistence failure");
            for chunk in removed_chunks {
                if state.index.add(&chunk.id, &chunk.embedding).is_err() {
                    warn!(library_id, chunk_id = %chunk.id, "index restore failed during rollback");
                }
                state.chunks.insert(chunk.id.clone(), chunk);
            }
            state.documents.insert(document_id.to_string(), document);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        debug!(library_id, op = "delete_document", n_chunks = removed_ids.len(), "document deleted");
        Ok(())
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    pub async fn create_chunk(&self, library_id: &str, new: NewChunk) -> Result<Chunk> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let chunk = Self::admit_chunk(&mut state, library_id, new)?;

        if let Err(e) = self.storage.save_chunk(&chunk).await {
            warn!(library_id, op = "create_chunk", kind = e.kind(), "rolled back after persistence failure");
            state.chunks.remove(&chunk.id);
            state.index.remove(&chunk.id);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(chunk)
    }

    /// Validate and install one chunk into the maps and index. Caller holds
    /// the writer lock and persists afterwards.
    fn admit_chunk(state: &mut LibraryState, library_id: &str, new: NewChunk) -> Result<Chunk> {
        if !state.documents.contains_key(&new.document_id) {
            return Err(EngineError::NotFound(format!(
                "document {}",
                new.document_id
            )));
        }
        if new.text.is_empty() {
            return Err(EngineError::Validation("chunk text must not be empty".into()));
        }
        Self::validate_embedding(state.library.dims, &new.embedding)?;

        let chunk = Chunk::new(
            library_id.to_string(),
            new.document_id,
            new.text,
            new.embedding,
            new.metadata,
        );
        state.index.add(&chunk.id, &chunk.embedding)?;
        state.chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(chunk)
    }

    /// Batch create: atomic with respect to the handle lock. Any element
    /// failure rolls back the batch's prior insertions.
    pub async fn create_chunks_batch(
        &self,
        library_id: &str,
        items: Vec<NewChunk>,
    ) -> Result<Vec<Chunk>> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let mut admitted: Vec<Chunk> = Vec::with_capacity(items.len());
        for new in items {
            match Self::admit_chunk(&mut state, library_id, new) {
                Ok(chunk) => admitted.push(chunk),
                Err(e) => {
                    for chunk in &admitted {
                        state.chunks.remove(&chunk.id);
                        state.index.remove(&chunk.id);
                    }
                    return Err(e);
                }
            }
        }

        let mut persisted = 0usize;
        for chunk in &admitted {
            if let Err(e) = self.storage.save_chunk(chunk).await {
                warn!(library_id, op = "create_chunks_batch", kind = e.kind(), "rolled back after persistence failure");
                for chunk in &admitted {
                    state.chunks.remove(&chunk.id);
                    state.index.remove(&chunk.id);
                }
                // best-effort cleanup of records persisted before the failure
                for chunk in admitted.iter().take(persisted) {
                    if self.storage.delete_chunk(&chunk.id).await.is_err() {
                        warn!(library_id, chunk_id = %chunk.id, "orphaned record cleanup failed");
                    }
                }
                return Err(e);
            }
            persisted += 1;
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(admitted)
    }

    pub async fn get_chunk(&self, library_id: &str, chunk_id: &str) -> Result<Chunk> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        state
            .chunks
            .get(chunk_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("chunk {chunk_id}")))
    }

    pub async fn list_chunks(&self, library_id: &str) -> Result<Vec<Chunk>> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        let mut chunks: Vec<Chunk> = state.chunks.values().cloned().collect();
        chunks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(chunks)
    }

    pub async fn update_chunk(
        &self,
        library_id: &str,
        chunk_id: &str,
        patch: ChunkPatch,
    ) -> Result<Chunk> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let previous = state
            .chunks
            .get(chunk_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("chunk {chunk_id}")))?;

        if let Some(text) = &patch.text {
            if text.is_empty() {
                return Err(EngineError::Validation("chunk text must not be empty".into()));
            }
        }
        if let Some(embedding) = &patch.embedding {
            Self::validate_embedding(state.library.dims, embedding)?;
        }

        let embedding_changed = patch.embedding.is_some();
        let updated = {
            let chunk = state
                .chunks
                .get_mut(chunk_id)
                .ok_or_else(|| EngineError::NotFound(format!("chunk {chunk_id}")))?;
            if let Some(text) = patch.text {
                chunk.text = text;
            }
            if let Some(embedding) = patch.embedding {
                chunk.embedding = embedding;
            }
            if let Some(metadata) = patch.metadata {
                chunk.metadata = metadata;
            }
            chunk.touch();
            chunk.clone()
        };

        // Updating an embedding is remove-then-insert against the index;
        // `add` overwrites in place.
        if embedding_changed {
            state.index.add(chunk_id, &updated.embedding)?;
        }

        if let Err(e) = self.storage.save_chunk(&updated).await {
            warn!(library_id, op = "update_chunk", kind = e.kind(), "rolled back after persistence failure");
            if embedding_changed && state.index.add(chunk_id, &previous.embedding).is_err() {
                warn!(library_id, chunk_id, "index restore failed during rollback");
            }
            state.chunks.insert(chunk_id.to_string(), previous);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(updated)
    }

    pub async fn delete_chunk(&self, library_id: &str, chunk_id: &str) -> Result<()> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let chunk = state
            .chunks
            .remove(chunk_id)
            .ok_or_else(|| EngineError::NotFound(format!("chunk {chunk_id}")))?;
        state.index.remove(chunk_id);

        if let Err(e) = self.storage.delete_chunk(chunk_id).await {
            warn!(library_id, op = "delete_chunk", kind = e.kind(), "rolled back after persistence failure");
            if state.index.add(chunk_id, &chunk.embedding).is_err() {
                warn!(library_id, chunk_id, "index restore failed during rollback");
            }
            state.chunks.insert(chunk_id.to_string(), chunk);
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(())
    }

    /// Remove every chunk of a library and reset the index.
    pub async fn delete_all_chunks(&self, library_id: &str) -> Result<usize> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        let previous = std::mem::take(&mut state.chunks);
        let n = previous.len();
        if let Err(e) = state.index.rebuild(&HashMap::new()) {
            state.chunks = previous;
            return Err(e);
        }

        if let Err(e) = self.storage.delete_chunks_for_library(library_id).await {
            warn!(library_id, op = "delete_all_chunks", kind = e.kind(), "rolled back after persistence failure");
            state.chunks = previous;
            let snapshot = state.chunk_snapshot();
            if state.index.rebuild(&snapshot).is_err() {
                warn!(library_id, "index restore failed during rollback");
            }
            return Err(e);
        }
        metrics::MUTATIONS_TOTAL.inc();
        Ok(n)
    }

    // ========================================================================
    // Search, train, rebuild, stats
    // ========================================================================

    pub async fn search(
        &self,
        library_id: &str,
        query: &[f32],
        k: usize,
        include_chunk: bool,
    ) -> Result<Vec<SearchResult>> {
        let timer = metrics::SEARCH_LATENCY_SECONDS.start_timer();
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;

        Self::validate_embedding(state.library.dims, query)?;
        let k = k.clamp(1, MAX_SEARCH_K);

        let hits = state.index.search(query, k)?;
        let results = hits
            .into_iter()
            .map(|hit| {
                let chunk = if include_chunk {
                    state.chunks.get(&hit.id).cloned()
                } else {
                    None
                };
                SearchResult {
                    chunk_id: hit.id,
                    score: hit.score,
                    chunk,
                }
            })
            .collect();
        metrics::SEARCHES_TOTAL.inc();
        timer.observe_duration();
        Ok(results)
    }

    /// Train the library's index. Only IVF supports training; explicit
    /// sample vectors may stand in for the (possibly empty) chunk set.
    pub async fn train_index(
        &self,
        library_id: &str,
        samples: Option<Vec<Vec<f32>>>,
    ) -> Result<()> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;

        if state.library.index_kind != IndexKind::Ivf {
            return Err(EngineError::Validation(format!(
                "index kind {} does not support training",
                state.library.index_kind
            )));
        }
        let samples = match samples {
            Some(samples) => {
                for s in &samples {
                    Self::validate_embedding(state.library.dims, s)?;
                }
                samples
            }
            None => state.embeddings_sorted(),
        };

        let was_trained = state.library.index_trained;
        state.index.train(&samples)?;

        if !was_trained {
            state.library.index_trained = true;
            state.library.touch();
            if let Err(e) = self.storage.save_library(&state.library).await {
                warn!(library_id, op = "train_index", kind = e.kind(), "rolled back after persistence failure");
                // First train implies no chunks were admitted yet, so a
                // fresh untrained index restores the pre-op state exactly.
                state.library.index_trained = false;
                state.index = build_index(state.library.dims, &state.library.index_params);
                return Err(e);
            }
        }
        metrics::MUTATIONS_TOTAL.inc();
        info!(library_id, op = "train_index", n_samples = samples.len(), "index trained");
        Ok(())
    }

    /// Rebuild the index from the full chunk snapshot. Index state is a pure
    /// function of the chunk set, so nothing is persisted.
    pub async fn rebuild_index(&self, library_id: &str) -> Result<()> {
        let handle = self.handle(library_id)?;
        let mut state = handle.state.write().await;
        self.verify_installed(&handle)?;
        let snapshot = state.chunk_snapshot();
        state.index.rebuild(&snapshot)?;
        info!(library_id, op = "rebuild_index", n_chunks = snapshot.len(), "index rebuilt");
        Ok(())
    }

    pub async fn stats(&self, library_id: &str) -> Result<LibraryStats> {
        let handle = self.handle(library_id)?;
        let state = handle.state.read().await;
        self.verify_installed(&handle)?;
        Ok(LibraryStats {
            library_id: library_id.to_string(),
            name: state.library.name.clone(),
            dims: state.library.dims,
            index_kind: state.library.index_kind,
            n_documents: state.documents.len(),
            n_chunks: state.chunks.len(),
            index: state.index.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStorage;

    async fn service() -> (Arc<MemoryStorage>, VectorDbService) {
        let storage = Arc::new(MemoryStorage::new());
        let svc = VectorDbService::new(storage.clone());
        (storage, svc)
    }

    async fn flat_library(svc: &VectorDbService) -> Library {
        svc.create_library("docs".into(), 4, "flat", None, HashMap::new())
            .await
            .unwrap()
    }

    fn chunk(doc_id: &str, text: &str, embedding: Vec<f32>) -> NewChunk {
        NewChunk {
            document_id: doc_id.to_string(),
            text: text.to_string(),
            embedding,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_library_validates_inputs() {
        let (_, svc) = service().await;
        assert_eq!(
            svc.create_library(" ".into(), 4, "flat", None, HashMap::new())
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            svc.create_library("x".into(), 0, "flat", None, HashMap::new())
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            svc.create_library("x".into(), 4, "kdtree", None, HashMap::new())
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[tokio::test]
    async fn chunk_crud_keeps_index_coherent() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();

        let a = svc
            .create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        svc.create_chunk(&lib.id, chunk(&doc.id, "b", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_chunks, 2);
        assert_eq!(stats.index.size, 2);

        // update embedding relocates the index entry
        let patch = ChunkPatch {
            embedding: Some(vec![0.0, 0.0, 1.0, 0.0]),
            ..Default::default()
        };
        svc.update_chunk(&lib.id, &a.id, patch).await.unwrap();
        let hits = svc
            .search(&lib.id, &[0.0, 0.0, 1.0, 0.0], 1, false)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, a.id);

        svc.delete_chunk(&lib.id, &a.id).await.unwrap();
        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_chunks, 1);
        assert_eq!(stats.index.size, 1);
    }

    #[tokio::test]
    async fn chunk_requires_existing_document_and_matching_dims() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let err = svc
            .create_chunk(&lib.id, chunk("ghost", "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        let err = svc
            .create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = svc
            .create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, f32::NAN, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn persistence_failure_rolls_back_create() {
        let (storage, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();

        storage.set_fail_writes(true);
        let err = svc
            .create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream");
        storage.set_fail_writes(false);

        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_chunks, 0);
        assert_eq!(stats.index.size, 0);
    }

    #[tokio::test]
    async fn batch_failure_rolls_back_prior_insertions() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();

        let items = vec![
            chunk(&doc.id, "ok-1", vec![1.0, 0.0, 0.0, 0.0]),
            chunk(&doc.id, "ok-2", vec![0.0, 1.0, 0.0, 0.0]),
            chunk(&doc.id, "bad", vec![0.0, 1.0]), // dim mismatch
        ];
        let err = svc.create_chunks_batch(&lib.id, items).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_chunks, 0);
        assert_eq!(stats.index.size, 0);
    }

    #[tokio::test]
    async fn document_delete_cascades() {
        let (storage, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        let keep = svc
            .create_document(&lib.id, "other".into(), HashMap::new())
            .await
            .unwrap();
        svc.create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        svc.create_chunk(&lib.id, chunk(&keep.id, "b", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        svc.delete_document(&lib.id, &doc.id).await.unwrap();
        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_documents, 1);
        assert_eq!(stats.n_chunks, 1);
        assert_eq!(stats.index.size, 1);

        // storage agrees
        let snap = storage.load_all().await.unwrap();
        assert_eq!(snap.chunks_by_library[&lib.id].len(), 1);
        assert_eq!(snap.documents_by_library[&lib.id].len(), 1);
    }

    #[tokio::test]
    async fn immutable_fields_conflict() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let patch = LibraryPatch {
            dims: Some(8),
            ..Default::default()
        };
        assert_eq!(
            svc.update_library(&lib.id, patch).await.unwrap_err().kind(),
            "conflict"
        );

        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        let patch = DocumentPatch {
            library_id: Some("elsewhere".into()),
            ..Default::default()
        };
        assert_eq!(
            svc.update_document(&lib.id, &doc.id, patch)
                .await
                .unwrap_err()
                .kind(),
            "conflict"
        );
    }

    #[tokio::test]
    async fn train_is_ivf_only() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let err = svc.train_index(&lib.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn ivf_lifecycle_train_then_insert() {
        let (_, svc) = service().await;
        let params = serde_json::json!({ "n_clusters": 2, "n_probes": 2, "seed": 0 });
        let lib = svc
            .create_library("vecs".into(), 4, "ivf", Some(&params), HashMap::new())
            .await
            .unwrap();
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();

        // insert before train -> state error
        let err = svc
            .create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "state");

        // train on explicit samples, then inserts succeed
        let samples = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];
        svc.train_index(&lib.id, Some(samples)).await.unwrap();
        let lib_after = svc.get_library(&lib.id).await.unwrap();
        assert!(lib_after.index_trained);

        svc.create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        let hits = svc
            .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 1, true)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.as_ref().unwrap().text, "a");
    }

    #[tokio::test]
    async fn rebuild_is_fixed_point_at_service_level() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        for (text, v) in [
            ("a", vec![1.0, 0.0, 0.0, 0.0]),
            ("b", vec![0.0, 1.0, 0.0, 0.0]),
        ] {
            svc.create_chunk(&lib.id, chunk(&doc.id, text, v)).await.unwrap();
        }
        svc.rebuild_index(&lib.id).await.unwrap();
        let first = svc.search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 2, false).await.unwrap();
        svc.rebuild_index(&lib.id).await.unwrap();
        let second = svc.search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 2, false).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.chunk_id.clone()).collect::<Vec<_>>(),
            second.iter().map(|r| r.chunk_id.clone()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn delete_library_removes_everything() {
        let (storage, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        svc.create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        svc.delete_library(&lib.id).await.unwrap();
        assert_eq!(svc.get_library(&lib.id).await.unwrap_err().kind(), "not_found");
        let snap = storage.load_all().await.unwrap();
        assert!(snap.libraries.is_empty());
        assert!(snap.chunks_by_library.is_empty());
    }

    #[tokio::test]
    async fn search_clamps_k_and_handles_oversized_requests() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        svc.create_chunk(&lib.id, chunk(&doc.id, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        // larger than library size returns what is available
        let hits = svc
            .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 50_000, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        // k = 0 clamps up to 1
        let hits = svc
            .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 0, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_all_chunks_resets_index() {
        let (_, svc) = service().await;
        let lib = flat_library(&svc).await;
        let doc = svc
            .create_document(&lib.id, "intro".into(), HashMap::new())
            .await
            .unwrap();
        for i in 0..5 {
            let mut v = vec![0.0; 4];
            v[i % 4] = 1.0;
            svc.create_chunk(&lib.id, chunk(&doc.id, &format!("t{i}"), v))
                .await
                .unwrap();
        }
        let n = svc.delete_all_chunks(&lib.id).await.unwrap();
        assert_eq!(n, 5);
        let stats = svc.stats(&lib.id).await.unwrap();
        assert_eq!(stats.n_chunks, 0);
        assert_eq!(stats.index.size, 0);
    }
}
